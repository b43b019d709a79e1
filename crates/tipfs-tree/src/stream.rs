//! Readers at the boundary between the transport and the decoders.
//!
//! The decoders classify I/O errors by kind: an early end of stream or bad
//! deflate data is a malformed pack. A failure of the network stream itself
//! must not be read that way, so [`TransportStream`] wraps it in a
//! [`StreamFailure`] of kind `Other` and [`Error`](crate::Error) unwraps it
//! again once it leaves the decoder.

use crate::transport::ByteStream;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tipfs_git::{ObjectId, ObjectReader, PackStream};
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Why a transport stream stopped producing bytes.
#[derive(Debug)]
pub(crate) enum StreamFailure {
    /// The underlying stream returned an error.
    Transport(io::Error),
    /// The tree was cancelled.
    Cancelled,
}

impl StreamFailure {
    fn into_io(self) -> io::Error {
        io::Error::other(self)
    }

    /// Takes a failure back out of an I/O error, or returns the error
    /// unchanged if it did not come from a transport stream.
    pub(crate) fn recover(err: io::Error) -> Result<Self, io::Error> {
        if !err.get_ref().is_some_and(|inner| inner.is::<StreamFailure>()) {
            return Err(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<StreamFailure>()) {
            Some(Ok(failure)) => Ok(*failure),
            Some(Err(inner)) => Err(io::Error::other(inner)),
            None => Err(io::Error::other("transport stream failed")),
        }
    }
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport stream failed: {err}"),
            Self::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

impl std::error::Error for StreamFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Cancelled => None,
        }
    }
}

/// A transport byte stream that marks its own failures and stops when the
/// token is cancelled, waking a pending read if need be.
pub struct TransportStream {
    inner: ByteStream,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl TransportStream {
    pub(crate) fn new(inner: ByteStream, token: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.clone().cancelled_owned()),
            token,
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.token.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(StreamFailure::Cancelled.into_io()));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Err(err)) => Poll::Ready(Err(StreamFailure::Transport(err).into_io())),
            other => other,
        }
    }
}

/// Content of one blob, streamed from the remote and checked against the
/// blob id once read to the end.
///
/// Every read fails once the owning tree is cancelled, including reads that
/// could still be served from buffered data.
pub struct BlobReader {
    reader: ObjectReader<BufReader<PackStream<TransportStream>>>,
    token: CancellationToken,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader").finish_non_exhaustive()
    }
}

impl BlobReader {
    pub(crate) fn new(
        reader: ObjectReader<BufReader<PackStream<TransportStream>>>,
        token: CancellationToken,
    ) -> Self {
        Self { reader, token }
    }

    /// Content length in bytes.
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// The blob id.
    pub fn id(&self) -> ObjectId {
        self.reader.expected_id()
    }
}

impl AsyncRead for BlobReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(Err(StreamFailure::Cancelled.into_io()));
        }
        Pin::new(&mut this.reader).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tokio::io::AsyncReadExt;
    use tokio_util::io::StreamReader;

    fn failing_stream(prefix: &'static [u8], kind: io::ErrorKind) -> ByteStream {
        let chunks = vec![
            Ok(bytes::Bytes::from_static(prefix)),
            Err(io::Error::new(kind, "peer went away")),
        ];
        Box::new(StreamReader::new(stream::iter(chunks)))
    }

    #[tokio::test]
    async fn test_transport_error_is_marked() {
        let mut stream = TransportStream::new(
            failing_stream(b"abc", io::ErrorKind::UnexpectedEof),
            CancellationToken::new(),
        );
        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);

        match StreamFailure::recover(err) {
            Ok(StreamFailure::Transport(inner)) => {
                assert_eq!(inner.kind(), io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected a transport failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_stream_fails() {
        let token = CancellationToken::new();
        let mut stream = TransportStream::new(Box::new(&b"abcdef"[..]), token.clone());
        let mut first = [0u8; 2];
        stream.read_exact(&mut first).await.unwrap();

        token.cancel();
        let err = stream.read_u8().await.unwrap_err();
        assert!(matches!(StreamFailure::recover(err), Ok(StreamFailure::Cancelled)));
    }

    #[tokio::test]
    async fn test_cancel_wakes_pending_read() {
        let token = CancellationToken::new();
        let (_writer, reader) = tokio::io::duplex(64);
        let mut stream = TransportStream::new(Box::new(reader), token.clone());

        let read = tokio::spawn(async move { stream.read_u8().await });
        tokio::task::yield_now().await;
        token.cancel();

        let err = read.await.unwrap().unwrap_err();
        assert!(matches!(StreamFailure::recover(err), Ok(StreamFailure::Cancelled)));
    }

    #[test]
    fn test_other_errors_pass_through() {
        let err = io::Error::new(io::ErrorKind::InvalidData, "bad deflate");
        let err = StreamFailure::recover(err).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(err.to_string(), "bad deflate");
    }
}
