//! A read-only file tree over one commit of a remote git repository.
//!
//! [`RemoteTree`] negotiates refs with the remote, fetches the tip commit of
//! the configured reference at depth 1, and serves directory listings from
//! the resulting index. File content is fetched blob by blob when asked for.
//!
//! The network is behind [`Transport`]; [`MemoryRemote`] implements it in
//! memory for tests.

mod assembler;
mod config;
mod error;
mod memory;
mod provider;
mod stream;
mod transport;
mod watch;

pub use assembler::{normalize_path, TipCommit, TreeAssembler, TreeIndex, VirtualNode};
pub use config::RemoteConfig;
pub use error::Error;
pub use memory::MemoryRemote;
pub use provider::{fetch_advertisement, fetch_blob, DirectoryListing, Node, RemoteTree};
pub use stream::{BlobReader, TransportStream};
pub use transport::{ByteStream, Transport, TransportError};
pub use watch::ChangeToken;

/// Result type for remote tree operations.
pub type Result<T> = std::result::Result<T, Error>;
