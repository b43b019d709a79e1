//! Git wire formats for tipfs.
//!
//! This crate decodes what a git server sends to a shallow, read-only
//! client: pkt-line framing, the ref advertisement, and the pack stream with
//! its commit and tree bodies. It also encodes the fetch request, plus the
//! server-side halves (advertisement writer, request parser, pack builder)
//! used to stand up remotes in tests.
//!
//! Nothing here performs network I/O; streams come from whatever transport
//! the caller plugs in.

mod commit;
mod error;
mod inflate;
mod object;
mod pack;
mod pktline;
mod protocol;
mod tree;

pub use commit::{parse_commit, parse_signature_time, CommitInfo};
pub use error::GitError;
pub use inflate::InflateReader;
pub use object::{GitObject, HashAlgorithm, ObjectHasher, ObjectId, ObjectKind};
pub use pack::{
    DeltaBase, EntryHeader, ObjectReader, PackBuilder, PackHeader, PackObject, PackReader,
};
pub use pktline::{PackStream, PktLine, PktLineReader, PktLineWriter, MAX_PKT_DATA_LEN};
pub use protocol::{
    write_advertisement, AdvertisedRef, FetchRequest, RefAdvertisement, ServerCapabilities,
    UploadRequest,
};
pub use tree::{
    encode_tree, parse_tree, EntryKind, TreeEntry, DIRECTORY_MODE, EXECUTABLE_MODE, FILE_MODE,
};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
