//! Bounded zlib inflation over a buffered async stream.
//!
//! Pack entries are zlib streams laid end to end with nothing marking where
//! one stops. The reader below pulls compressed bytes through
//! [`AsyncBufRead`] and only consumes what the decompressor used, so the
//! underlying stream is left positioned at the next entry header.

use flate2::{Decompress, FlushDecompress, Status};
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};
use tracing::warn;

const DRAIN_CHUNK: usize = 512;

/// Inflates exactly `size` bytes from one zlib stream.
///
/// Reads past `size` yield end of file. Output the stream carries beyond
/// `size` is discarded with a warning when the reader is drained, and a
/// stream that ends short of `size` is an [`io::ErrorKind::InvalidData`]
/// error.
pub struct InflateReader<R> {
    reader: R,
    decompress: Decompress,
    size: u64,
    produced: u64,
    stream_end: bool,
    overrun_reported: bool,
}

impl<R: AsyncBufRead + Unpin> InflateReader<R> {
    /// Starts inflating a zlib stream whose decoded length is `size`.
    pub fn new(reader: R, size: u64) -> Self {
        Self {
            reader,
            decompress: Decompress::new(true),
            size,
            produced: 0,
            stream_end: false,
            overrun_reported: false,
        }
    }

    /// Declared decoded length.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes still to be returned before end of file.
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.produced)
    }

    /// Compressed bytes consumed so far.
    pub fn total_in(&self) -> u64 {
        self.decompress.total_in()
    }

    /// Runs the decompressor once into `out`.
    ///
    /// Returns the number of bytes written, or zero once the zlib stream has
    /// ended.
    fn poll_inflate(&mut self, cx: &mut Context<'_>, out: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            if self.stream_end {
                return Poll::Ready(Ok(0));
            }

            let input = ready!(Pin::new(&mut self.reader).poll_fill_buf(cx))?;
            let eof = input.is_empty();
            let flush = if eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };

            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(input, out, flush)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (self.decompress.total_in() - in_before) as usize;
            let written = (self.decompress.total_out() - out_before) as usize;
            Pin::new(&mut self.reader).consume(consumed);

            if status == Status::StreamEnd {
                self.stream_end = true;
                return Poll::Ready(Ok(written));
            }
            if written > 0 {
                return Poll::Ready(Ok(written));
            }
            if eof {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside compressed object",
                )));
            }
            if consumed == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "zlib stream made no progress",
                )));
            }
        }
    }

    /// Inflates and throws away everything up to the end of the zlib stream.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut scratch = [0u8; DRAIN_CHUNK];
        while !self.stream_end {
            let n = ready!(self.poll_inflate(cx, &mut scratch))?;
            self.produced += n as u64;
        }
        if self.produced > self.size && !self.overrun_reported {
            self.overrun_reported = true;
            warn!(
                declared = self.size,
                inflated = self.produced,
                "object inflated past its declared size; extra bytes ignored"
            );
        }
        Poll::Ready(Ok(()))
    }

    /// Drains the rest of the zlib stream and returns the underlying reader,
    /// positioned just past it.
    pub async fn finish(mut self) -> io::Result<R> {
        poll_fn(|cx| self.poll_drain(cx)).await?;
        Ok(self.reader)
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for InflateReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let remaining = this.remaining();
        if remaining == 0 {
            ready!(this.poll_drain(cx))?;
            return Poll::Ready(Ok(()));
        }

        let want = remaining.min(buf.remaining() as u64) as usize;
        if want == 0 {
            return Poll::Ready(Ok(()));
        }

        let out = buf.initialize_unfilled_to(want);
        let n = ready!(this.poll_inflate(cx, out))?;
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "zlib stream ended after {} of {} bytes",
                    this.produced, this.size
                ),
            )));
        }
        buf.advance(n);
        this.produced += n as u64;
        Poll::Ready(Ok(()))
    }
}
