//! Git protocol error types.

use std::io;
use thiserror::Error;

/// Errors that can occur while speaking the git protocol or decoding its data.
#[derive(Debug, Error)]
pub enum GitError {
    /// Invalid pack stream.
    #[error("invalid pack: {0}")]
    InvalidPack(String),

    /// Invalid pkt-line framing.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Malformed commit or tree body, or an unparseable object id.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an `ERR` packet.
    #[error("remote error: {0}")]
    Remote(String),

    /// Object not found.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl GitError {
    /// Classifies an I/O error raised while reading a pack stream.
    ///
    /// Truncation and corrupt deflate data are format failures; anything else
    /// came from the underlying transport and is kept as is.
    pub fn from_pack_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
                Self::InvalidPack(err.to_string())
            }
            _ => Self::Io(err),
        }
    }

    /// Returns true for errors caused by malformed data on the wire.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPack(_) | Self::InvalidPktLine(_) | Self::InvalidObject(_) | Self::Protocol(_)
        )
    }
}
