//! Git pkt-line format implementation.
//!
//! Each line is prefixed with a 4-character hex length that counts the prefix
//! itself, or "0000" for flush. The pack that ends an upload-pack response is
//! not framed at all; the reader recognises its `PACK` signature in the
//! position of a length prefix and hands the rest of the stream over raw.

use crate::{GitError, Result};
use std::io::Write;
use tokio::io::{AsyncRead, AsyncReadExt, Chain};

/// Largest packet git will send or accept, prefix included.
const MAX_PKT_LEN: usize = 65520;
/// Largest payload that fits in one packet.
pub const MAX_PKT_DATA_LEN: usize = MAX_PKT_LEN - 4;

const PACK_SIGNATURE: &[u8; 4] = b"PACK";

/// The raw pack stream left after framing stops: the `PACK` signature the
/// reader already consumed, followed by the rest of the underlying reader.
pub type PackStream<R> = Chain<&'static [u8], R>;

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
    /// The `PACK` signature appeared where a length prefix was expected.
    PackStart,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let len = data.len() + 4; // 4 bytes for the length prefix
                let mut result = format!("{:04x}", len).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => b"0000".to_vec(),
            Self::PackStart => PACK_SIGNATURE.to_vec(),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for special packets.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the data as a string, trimming any trailing newline.
    pub fn as_str(&self) -> Option<&str> {
        self.data()
            .and_then(|d| std::str::from_utf8(d).ok())
            .map(|s| s.trim_end_matches('\n'))
    }

    /// Returns the message of an `ERR <message>` packet.
    pub fn error_message(&self) -> Option<String> {
        let data = self.data()?;
        let rest = data.strip_prefix(b"ERR ")?;
        Some(String::from_utf8_lossy(rest).trim_end().to_string())
    }
}

/// Reader for pkt-line format.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet, or None at end of stream.
    pub async fn read(&mut self) -> Result<Option<PktLine>> {
        self.read_packet(false).await
    }

    /// Reads the next packet, treating a `PACK` prefix as the end of framing.
    pub async fn read_expecting_pack(&mut self) -> Result<Option<PktLine>> {
        self.read_packet(true).await
    }

    async fn read_packet(&mut self, expect_pack: bool) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            let n = self.reader.read(&mut len_buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(GitError::InvalidPktLine(format!(
                    "stream ended inside length prefix after {:?}",
                    String::from_utf8_lossy(&len_buf[..filled])
                )));
            }
            filled += n;
        }

        if expect_pack && &len_buf == PACK_SIGNATURE {
            return Ok(Some(PktLine::PackStart));
        }

        if !len_buf.iter().all(u8::is_ascii_hexdigit) {
            return Err(GitError::InvalidPktLine(format!(
                "expected 4 hex digits, found {:?}",
                String::from_utf8_lossy(&len_buf)
            )));
        }
        // All four bytes are hex digits, so this cannot fail.
        let len = len_buf
            .iter()
            .fold(0usize, |acc, &b| acc * 16 + hex_value(b) as usize);

        match len {
            0 => Ok(Some(PktLine::Flush)),
            1..=3 => Err(GitError::InvalidPktLine(format!(
                "length {:04x} is below the minimum of 0004",
                len
            ))),
            _ => {
                let data_len = len - 4;
                let mut data = vec![0u8; data_len];
                self.reader.read_exact(&mut data).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        GitError::InvalidPktLine(format!(
                            "stream ended inside a {} byte packet",
                            data_len
                        ))
                    } else {
                        e.into()
                    }
                })?;
                Ok(Some(PktLine::Data(data)))
            }
        }
    }

    /// Reads all packets until a flush packet or end of stream.
    pub async fn read_until_flush(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        loop {
            match self.read().await? {
                Some(PktLine::Flush) | None => break,
                Some(pkt) => packets.push(pkt),
            }
        }
        Ok(packets)
    }

    /// Skips every packet up to the start of the pack.
    ///
    /// Acknowledgements, shallow lines, flushes and even a whole ref
    /// advertisement may precede the pack depending on the transport.
    pub async fn skip_to_pack(&mut self) -> Result<()> {
        let mut skipped = 0usize;
        loop {
            match self.read_expecting_pack().await? {
                Some(PktLine::PackStart) => {
                    tracing::trace!(skipped, "found pack signature");
                    return Ok(());
                }
                Some(pkt) => {
                    if let Some(message) = pkt.error_message() {
                        return Err(GitError::Remote(message));
                    }
                    skipped += 1;
                }
                None => {
                    return Err(GitError::Protocol(format!(
                        "expected PACK after {} packets, stream ended",
                        skipped
                    )))
                }
            }
        }
    }

    /// Returns a mutable reference to the inner reader.
    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consumes the reader and returns the inner reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Consumes the reader after [`PktLine::PackStart`] and returns the pack
    /// stream, signature included.
    pub fn into_pack_stream(self) -> PackStream<R> {
        let signature: &'static [u8] = PACK_SIGNATURE;
        signature.chain(self.reader)
    }
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        if let PktLine::Data(data) = pkt {
            if data.len() > MAX_PKT_DATA_LEN {
                return Err(GitError::InvalidPktLine(format!(
                    "{} byte payload exceeds the maximum of {}",
                    data.len(),
                    MAX_PKT_DATA_LEN
                )));
            }
        }
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes a data line.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.write(&PktLine::Data(data.to_vec()))
    }

    /// Writes a string line (with newline).
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
