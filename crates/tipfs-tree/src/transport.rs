//! The transport seam.
//!
//! A transport moves bytes to and from a git server (smart HTTP, SSH, or an
//! in-memory fixture). Everything above it is shared.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// A response body, read as it arrives.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Whatever error the transport produced.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// A way to talk to `git-upload-pack` on a remote.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches the ref advertisement.
    async fn info_refs(&self) -> Result<ByteStream, TransportError>;

    /// Sends a request to upload-pack and returns its reply.
    async fn upload_pack(&self, request: Bytes) -> Result<ByteStream, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn info_refs(&self) -> Result<ByteStream, TransportError> {
        (**self).info_refs().await
    }

    async fn upload_pack(&self, request: Bytes) -> Result<ByteStream, TransportError> {
        (**self).upload_pack(request).await
    }
}
