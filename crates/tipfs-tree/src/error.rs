//! Error types for the remote tree.

use crate::stream::StreamFailure;
use crate::transport::TransportError;
use std::sync::Arc;
use thiserror::Error;
use tipfs_git::GitError;

/// Errors raised while populating or reading a remote tree.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed data from the server, or a server-reported error.
    #[error(transparent)]
    Git(GitError),

    /// The configured reference is not advertised by the remote.
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    /// The transport failed; passed through unchanged.
    #[error(transparent)]
    Transport(TransportError),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The background population task panicked or was aborted.
    #[error("population task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Population failed; every later lookup replays this error.
    #[error("population failed: {0}")]
    Population(Arc<Error>),

    /// A coalesced blob fetch, run on behalf of several callers, failed.
    #[error("shared fetch failed: {0}")]
    Shared(Arc<Error>),
}

impl From<GitError> for Error {
    /// Failures of the transport stream and cancellation reach the decoders
    /// as I/O errors; they come back out here as their own variants.
    fn from(err: GitError) -> Self {
        match err {
            GitError::Io(io) => match StreamFailure::recover(io) {
                Ok(StreamFailure::Transport(inner)) => Self::Transport(Box::new(inner)),
                Ok(StreamFailure::Cancelled) => Self::Cancelled,
                Err(io) => Self::Git(GitError::Io(io)),
            },
            other => Self::Git(other),
        }
    }
}

impl Error {
    /// Returns the underlying error, looking through shared wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::Population(inner) | Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Returns true for malformed-data errors.
    pub fn is_format_error(&self) -> bool {
        matches!(self.root(), Self::Git(err) if err.is_format_error())
    }

    /// Returns true if the error came from the transport.
    pub fn is_transport_error(&self) -> bool {
        matches!(self.root(), Self::Transport(_))
    }
}
