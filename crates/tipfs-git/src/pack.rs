//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format
//!
//! [`PackReader`] decodes a pack as it arrives, one entry at a time, without
//! ever holding a blob body in memory. [`PackBuilder`] writes packs and is
//! what test remotes serve.

use crate::commit::{parse_commit, CommitInfo};
use crate::inflate::InflateReader;
use crate::tree::{parse_tree, TreeEntry};
use crate::{GitError, GitObject, HashAlgorithm, ObjectHasher, ObjectId, ObjectKind, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, trace, warn};

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version written by [`PackBuilder`].
const PACK_VERSION: u32 = 2;
/// Chunk size used when streaming blob bodies through the hasher.
const BLOB_CHUNK: usize = 8 * 1024;
/// Commit and tree bodies are buffered; this caps the initial allocation.
const MAX_PREALLOC: u64 = 1 << 20;

/// The fixed 12-byte pack header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackHeader {
    /// Pack format version, as sent. Not validated.
    pub version: u32,
    /// Number of entries that follow.
    pub object_count: u32,
}

/// Where a delta entry finds its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaBase {
    /// Distance back from this entry's start (ofs-delta).
    Offset(u64),
    /// Id of the base object (ref-delta).
    Id(ObjectId),
}

/// Decoded header of one pack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    /// Entry type.
    pub kind: ObjectKind,
    /// Inflated size of the entry body.
    pub size: u64,
    /// Base reference, for delta entries only.
    pub base: Option<DeltaBase>,
}

/// One decoded pack entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackObject {
    /// A commit and the headers a checkout needs.
    Commit {
        /// Commit id.
        id: ObjectId,
        /// Parsed commit headers.
        info: CommitInfo,
    },
    /// A tree and its file and directory entries.
    Tree {
        /// Tree id.
        id: ObjectId,
        /// Entries in tree order.
        entries: Vec<TreeEntry>,
    },
    /// A blob; only its id and length are kept.
    Blob {
        /// Blob id.
        id: ObjectId,
        /// Content length in bytes.
        size: u64,
    },
    /// An entry that was read past without being interpreted.
    ///
    /// Tags carry their computed id; deltas have none, since their target
    /// id is only known after reconstruction.
    Skipped {
        /// Object id, when it can be computed.
        id: Option<ObjectId>,
        /// Entry type.
        kind: ObjectKind,
        /// Inflated size of the entry body.
        size: u64,
    },
}

impl PackObject {
    /// Returns the object id, if known.
    pub fn id(&self) -> Option<ObjectId> {
        match self {
            Self::Commit { id, .. } | Self::Tree { id, .. } | Self::Blob { id, .. } => Some(*id),
            Self::Skipped { id, .. } => *id,
        }
    }
}

/// Streaming pack decoder.
pub struct PackReader<R> {
    reader: R,
    algorithm: HashAlgorithm,
    header: PackHeader,
    remaining: u32,
}

impl<R: AsyncBufRead + Unpin> PackReader<R> {
    /// Reads and checks the pack header.
    pub async fn new(mut reader: R, algorithm: HashAlgorithm) -> Result<Self> {
        let mut raw = [0u8; 12];
        reader.read_exact(&mut raw).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                GitError::InvalidPack("truncated pack header".to_string())
            } else {
                e.into()
            }
        })?;

        if &raw[0..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPack(format!(
                "invalid signature {:?}",
                String::from_utf8_lossy(&raw[0..4])
            )));
        }

        let header = PackHeader {
            version: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            object_count: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        };
        debug!(
            version = header.version,
            objects = header.object_count,
            "reading pack"
        );

        Ok(Self {
            reader,
            algorithm,
            header,
            remaining: header.object_count,
        })
    }

    /// Returns the pack header.
    pub fn header(&self) -> PackHeader {
        self.header
    }

    /// Number of entries not yet read.
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Decodes the next entry, or returns None after the last one.
    ///
    /// The trailing pack checksum is never read.
    pub async fn next_object(&mut self) -> Result<Option<PackObject>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let entry = read_entry_header(&mut self.reader, self.algorithm).await?;
        let algorithm = self.algorithm;

        let object = match entry.kind {
            ObjectKind::Commit | ObjectKind::Tree | ObjectKind::Tag => {
                let body = read_body(&mut self.reader, entry.size).await?;
                let id = ObjectId::hash_object(algorithm, entry.kind, &body);
                match entry.kind {
                    ObjectKind::Commit => PackObject::Commit {
                        id,
                        info: parse_commit(algorithm, &body)?,
                    },
                    ObjectKind::Tree => PackObject::Tree {
                        id,
                        entries: parse_tree(algorithm, &body)?,
                    },
                    _ => {
                        trace!(%id, "skipping tag");
                        PackObject::Skipped {
                            id: Some(id),
                            kind: entry.kind,
                            size: entry.size,
                        }
                    }
                }
            }
            ObjectKind::Blob => {
                let mut inflater = InflateReader::new(&mut self.reader, entry.size);
                let mut hasher = ObjectHasher::for_object(algorithm, ObjectKind::Blob, entry.size);
                let mut chunk = vec![0u8; BLOB_CHUNK];
                loop {
                    let n = inflater
                        .read(&mut chunk)
                        .await
                        .map_err(GitError::from_pack_io)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&chunk[..n]);
                }
                inflater.finish().await.map_err(GitError::from_pack_io)?;
                PackObject::Blob {
                    id: hasher.finish(),
                    size: entry.size,
                }
            }
            ObjectKind::OfsDelta | ObjectKind::RefDelta => {
                warn!(
                    kind = %entry.kind,
                    base = ?entry.base,
                    size = entry.size,
                    "delta entries are not reconstructed; skipping"
                );
                discard_body(&mut self.reader, entry.size).await?;
                PackObject::Skipped {
                    id: None,
                    kind: entry.kind,
                    size: entry.size,
                }
            }
        };

        Ok(Some(object))
    }

    /// Skips ahead to the first blob and returns a reader over its content.
    ///
    /// The content is checked against `expected` once it has been read to
    /// the end.
    pub async fn into_blob(mut self, expected: ObjectId) -> Result<ObjectReader<R>> {
        while self.remaining > 0 {
            self.remaining -= 1;
            let entry = read_entry_header(&mut self.reader, self.algorithm).await?;
            if entry.kind == ObjectKind::Blob {
                return Ok(ObjectReader::new(
                    InflateReader::new(self.reader, entry.size),
                    self.algorithm,
                    expected,
                ));
            }
            trace!(kind = %entry.kind, "skipping entry while looking for blob");
            discard_body(&mut self.reader, entry.size).await?;
        }
        Err(GitError::ObjectNotFound(expected.to_hex()))
    }
}

async fn read_pack_byte<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<u8> {
    reader.read_u8().await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            GitError::InvalidPack("truncated object header".to_string())
        } else {
            e.into()
        }
    })
}

/// Reads a type and size header, plus the base reference of delta entries.
async fn read_entry_header<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    algorithm: HashAlgorithm,
) -> Result<EntryHeader> {
    // First byte: (MSB=more bytes) (3 bits type) (4 bits size)
    let first_byte = read_pack_byte(reader).await?;
    let kind = ObjectKind::from_pack_type((first_byte >> 4) & 0x07)?;
    let mut size = u64::from(first_byte & 0x0F);
    let mut shift = 4u32;
    let mut byte = first_byte;

    // Additional size bytes (7 bits each, MSB=continue)
    while byte & 0x80 != 0 {
        byte = read_pack_byte(reader).await?;
        let group = u64::from(byte & 0x7F);
        if shift >= u64::BITS || (group << shift) >> shift != group {
            return Err(GitError::InvalidPack("object size overflows".to_string()));
        }
        size |= group << shift;
        shift += 7;
    }

    let base = match kind {
        ObjectKind::OfsDelta => {
            let mut byte = read_pack_byte(reader).await?;
            let mut offset = u64::from(byte & 0x7F);
            while byte & 0x80 != 0 {
                byte = read_pack_byte(reader).await?;
                offset = offset
                    .checked_add(1)
                    .and_then(|o| o.checked_mul(128))
                    .map(|o| o | u64::from(byte & 0x7F))
                    .ok_or_else(|| GitError::InvalidPack("delta offset overflows".to_string()))?;
            }
            Some(DeltaBase::Offset(offset))
        }
        ObjectKind::RefDelta => {
            let mut raw = vec![0u8; algorithm.raw_len()];
            reader.read_exact(&mut raw).await.map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    GitError::InvalidPack("truncated delta base id".to_string())
                } else {
                    e.into()
                }
            })?;
            Some(DeltaBase::Id(ObjectId::from_raw(algorithm, &raw)?))
        }
        _ => None,
    };

    Ok(EntryHeader { kind, size, base })
}

async fn read_body<R: AsyncBufRead + Unpin>(reader: &mut R, size: u64) -> Result<Vec<u8>> {
    let mut inflater = InflateReader::new(reader, size);
    let mut body = Vec::with_capacity(size.min(MAX_PREALLOC) as usize);
    inflater
        .read_to_end(&mut body)
        .await
        .map_err(GitError::from_pack_io)?;
    inflater.finish().await.map_err(GitError::from_pack_io)?;
    Ok(body)
}

async fn discard_body<R: AsyncBufRead + Unpin>(reader: &mut R, size: u64) -> Result<()> {
    let mut inflater = InflateReader::new(reader, size);
    tokio::io::copy(&mut inflater, &mut tokio::io::sink())
        .await
        .map_err(GitError::from_pack_io)?;
    inflater.finish().await.map_err(GitError::from_pack_io)?;
    Ok(())
}

/// Streams one blob's content and verifies its id at end of file.
///
/// A mismatch surfaces as an [`io::ErrorKind::InvalidData`] error from the
/// final read.
pub struct ObjectReader<R> {
    inflater: InflateReader<R>,
    hasher: Option<ObjectHasher>,
    expected: ObjectId,
}

impl<R: AsyncBufRead + Unpin> ObjectReader<R> {
    fn new(inflater: InflateReader<R>, algorithm: HashAlgorithm, expected: ObjectId) -> Self {
        let hasher = ObjectHasher::for_object(algorithm, ObjectKind::Blob, inflater.size());
        Self {
            inflater,
            hasher: Some(hasher),
            expected,
        }
    }

    /// Content length in bytes.
    pub fn size(&self) -> u64 {
        self.inflater.size()
    }

    /// The id the content is checked against.
    pub fn expected_id(&self) -> ObjectId {
        self.expected
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for ObjectReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inflater).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];

        if !fresh.is_empty() {
            if let Some(hasher) = this.hasher.as_mut() {
                hasher.update(fresh);
            }
        } else if let Some(hasher) = this.hasher.take() {
            let actual = hasher.finish();
            if actual != this.expected {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "object id mismatch: expected {}, content hashes to {}",
                        this.expected, actual
                    ),
                )));
            }
        }
        Poll::Ready(Ok(()))
    }
}

enum PackEntry {
    Object(GitObject),
    OfsDelta { distance: u64, delta: Vec<u8> },
    RefDelta { base: ObjectId, delta: Vec<u8> },
}

/// Builds a pack file from a set of objects.
pub struct PackBuilder {
    algorithm: HashAlgorithm,
    entries: Vec<PackEntry>,
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            entries: Vec::new(),
        }
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.entries.push(PackEntry::Object(object));
    }

    /// Adds an ofs-delta entry whose base starts `distance` bytes earlier.
    pub fn add_ofs_delta(&mut self, distance: u64, delta: Vec<u8>) {
        self.entries.push(PackEntry::OfsDelta { distance, delta });
    }

    /// Adds a ref-delta entry against `base`.
    pub fn add_ref_delta(&mut self, base: ObjectId, delta: Vec<u8>) {
        self.entries.push(PackEntry::RefDelta { base, delta });
    }

    /// Number of entries added so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries have been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the pack file, trailing checksum included.
    pub fn build(self) -> Result<Vec<u8>> {
        let count = u32::try_from(self.entries.len())
            .map_err(|_| GitError::InvalidPack("too many objects for one pack".to_string()))?;

        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&count.to_be_bytes());

        for entry in &self.entries {
            match entry {
                PackEntry::Object(object) => {
                    write_entry_header(&mut pack, object.kind, object.data.len());
                    write_compressed(&mut pack, &object.data)?;
                }
                PackEntry::OfsDelta { distance, delta } => {
                    write_entry_header(&mut pack, ObjectKind::OfsDelta, delta.len());
                    pack.extend_from_slice(&encode_offset(*distance));
                    write_compressed(&mut pack, delta)?;
                }
                PackEntry::RefDelta { base, delta } => {
                    write_entry_header(&mut pack, ObjectKind::RefDelta, delta.len());
                    pack.extend_from_slice(base.as_bytes());
                    write_compressed(&mut pack, delta)?;
                }
            }
        }

        let mut hasher = ObjectHasher::new(self.algorithm);
        hasher.update(&pack);
        pack.extend_from_slice(hasher.finish().as_bytes());

        Ok(pack)
    }
}

fn write_entry_header(pack: &mut Vec<u8>, kind: ObjectKind, size: usize) {
    let mut first_byte = (kind.pack_type() << 4) | ((size & 0x0F) as u8);
    let mut remaining_size = size >> 4;

    if remaining_size > 0 {
        first_byte |= 0x80;
    }
    pack.push(first_byte);

    while remaining_size > 0 {
        let mut byte = (remaining_size & 0x7F) as u8;
        remaining_size >>= 7;
        if remaining_size > 0 {
            byte |= 0x80;
        }
        pack.push(byte);
    }
}

fn write_compressed(pack: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    pack.extend_from_slice(&encoder.finish()?);
    Ok(())
}

// Big-endian groups of 7 bits, each continuation group stored minus one.
fn encode_offset(mut offset: u64) -> Vec<u8> {
    let mut bytes = vec![(offset & 0x7F) as u8];
    offset >>= 7;
    while offset > 0 {
        offset -= 1;
        bytes.push(0x80 | (offset & 0x7F) as u8);
        offset >>= 7;
    }
    bytes.reverse();
    bytes
}
