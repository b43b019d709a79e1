//! Object ids, hash algorithms and object kinds.

use crate::tree::{encode_tree, TreeEntry};
use crate::{GitError, Result};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hash function used for object ids in a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// 20-byte SHA-1 ids, the git default.
    #[default]
    Sha1,
    /// 32-byte SHA-256 ids (`object-format=sha256`).
    Sha256,
}

impl HashAlgorithm {
    /// Length of a raw id in bytes.
    pub const fn raw_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Length of a hex id in characters.
    pub const fn hex_len(self) -> usize {
        self.raw_len() * 2
    }

    /// Returns the name used by the `object-format` capability.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Parses an `object-format` capability value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Returns the all-zero id advertised by empty repositories.
    pub fn null_id(self) -> ObjectId {
        match self {
            Self::Sha1 => ObjectId::Sha1([0u8; 20]),
            Self::Sha256 => ObjectId::Sha256([0u8; 32]),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content hash identifying a git object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// SHA-1 id.
    Sha1([u8; 20]),
    /// SHA-256 id.
    Sha256([u8; 32]),
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Creates an id from raw digest bytes.
    pub fn from_raw(algorithm: HashAlgorithm, raw: &[u8]) -> Result<Self> {
        if raw.len() != algorithm.raw_len() {
            return Err(GitError::InvalidObject(format!(
                "expected {} id bytes for {}, got {}",
                algorithm.raw_len(),
                algorithm,
                raw.len()
            )));
        }
        Ok(match algorithm {
            HashAlgorithm::Sha1 => {
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(raw);
                Self::Sha1(bytes)
            }
            HashAlgorithm::Sha256 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(raw);
                Self::Sha256(bytes)
            }
        })
    }

    /// Parses a hex id, picking the algorithm from its length.
    pub fn from_hex(hex: &str) -> Result<Self> {
        match hex.len() {
            40 => Self::from_hex_with(HashAlgorithm::Sha1, hex),
            64 => Self::from_hex_with(HashAlgorithm::Sha256, hex),
            len => Err(GitError::InvalidObject(format!(
                "invalid object id length: {}",
                len
            ))),
        }
    }

    /// Parses a hex id that must belong to `algorithm`.
    pub fn from_hex_with(algorithm: HashAlgorithm, hex: &str) -> Result<Self> {
        if hex.len() != algorithm.hex_len() {
            return Err(GitError::InvalidObject(format!(
                "expected {} hex digits for {}, got {:?}",
                algorithm.hex_len(),
                algorithm,
                hex
            )));
        }
        let raw = hex::decode(hex).map_err(|e| GitError::InvalidObject(e.to_string()))?;
        Self::from_raw(algorithm, &raw)
    }

    /// Returns true if `s` has exactly the shape of an `algorithm` hex id.
    pub fn is_hex(algorithm: HashAlgorithm, s: &str) -> bool {
        s.len() == algorithm.hex_len() && s.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Returns the algorithm this id was computed with.
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(bytes) => bytes,
            Self::Sha256(bytes) => bytes,
        }
    }

    /// Returns the lowercase hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Returns true for the all-zero id.
    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// Computes the id of an object from its kind and body.
    pub fn hash_object(algorithm: HashAlgorithm, kind: ObjectKind, data: &[u8]) -> Self {
        let mut hasher = ObjectHasher::for_object(algorithm, kind, data.len() as u64);
        hasher.update(data);
        hasher.finish()
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

enum HasherState {
    Sha1(Sha1),
    Sha256(Sha256),
}

/// Incremental object id computation.
///
/// Seeded with the canonical `"<kind> <size>\0"` header, so feeding it the
/// object body yields the same id git would assign.
pub struct ObjectHasher {
    state: HasherState,
}

impl ObjectHasher {
    /// Starts a bare digest with no object header.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Self { state }
    }

    /// Starts a digest seeded with the object header for `kind` and `size`.
    pub fn for_object(algorithm: HashAlgorithm, kind: ObjectKind, size: u64) -> Self {
        let mut hasher = Self::new(algorithm);
        hasher.update(format!("{} {}\0", kind.as_str(), size).as_bytes());
        hasher
    }

    /// Feeds bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
        }
    }

    /// Finishes the digest.
    pub fn finish(self) -> ObjectId {
        match self.state {
            HasherState::Sha1(h) => {
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(&h.finalize());
                ObjectId::Sha1(bytes)
            }
            HasherState::Sha256(h) => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&h.finalize());
                ObjectId::Sha256(bytes)
            }
        }
    }
}

/// Object kinds as they appear in pack entry headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Commit object.
    Commit,
    /// Directory listing.
    Tree,
    /// File content.
    Blob,
    /// Annotated tag.
    Tag,
    /// Delta against a base at a relative pack offset.
    OfsDelta,
    /// Delta against a base named by id.
    RefDelta,
}

impl ObjectKind {
    /// Returns the name used in object headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
            Self::OfsDelta => "ofs-delta",
            Self::RefDelta => "ref-delta",
        }
    }

    /// Returns the type code used in pack files.
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
            Self::OfsDelta => 6,
            Self::RefDelta => 7,
        }
    }

    /// Parses a pack file type code.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            6 => Ok(Self::OfsDelta),
            7 => Ok(Self::RefDelta),
            _ => Err(GitError::InvalidPack(format!(
                "unknown pack object type: {}",
                code
            ))),
        }
    }

    /// Returns true for the two delta encodings.
    pub fn is_delta(&self) -> bool {
        matches!(self, Self::OfsDelta | Self::RefDelta)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete git object held in memory.
#[derive(Debug, Clone)]
pub struct GitObject {
    /// The object's id.
    pub id: ObjectId,
    /// The type of object.
    pub kind: ObjectKind,
    /// The raw object body (uncompressed, without header).
    pub data: Bytes,
}

impl GitObject {
    /// Creates an object, computing its id from the data.
    pub fn new(algorithm: HashAlgorithm, kind: ObjectKind, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(algorithm, kind, &data);
        Self { id, kind, data }
    }

    /// Creates a blob object from file content.
    pub fn blob(algorithm: HashAlgorithm, content: impl Into<Bytes>) -> Self {
        Self::new(algorithm, ObjectKind::Blob, content)
    }

    /// Creates a tree object from its entries.
    pub fn tree(algorithm: HashAlgorithm, entries: &[TreeEntry]) -> Self {
        Self::new(algorithm, ObjectKind::Tree, encode_tree(entries))
    }

    /// Creates a commit object.
    pub fn commit(
        algorithm: HashAlgorithm,
        tree_id: &ObjectId,
        parents: &[ObjectId],
        author: &str,
        committer: &str,
        message: &str,
    ) -> Self {
        let mut content = format!("tree {}\n", tree_id);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", committer));
        content.push_str(&format!("\n{}", message));
        Self::new(algorithm, ObjectKind::Commit, content.into_bytes())
    }

    /// Returns the size of the object body.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex_roundtrip() {
        let hex = "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3";
        let id = ObjectId::from_hex(hex).unwrap();
        assert_eq!(id.algorithm(), HashAlgorithm::Sha1);
        assert_eq!(id.to_hex(), hex);
    }

    #[test]
    fn test_object_id_uppercase_renders_lowercase() {
        let id = ObjectId::from_hex("A94A8FE5CCB19BA61C4C0873D391E987982FBBD3").unwrap();
        assert_eq!(id.to_hex(), "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3");
    }

    #[test]
    fn test_object_id_sha256_length() {
        let hex = "ab".repeat(32);
        let id = ObjectId::from_hex(&hex).unwrap();
        assert_eq!(id.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(id.as_bytes().len(), 32);
    }

    #[test]
    fn test_object_id_invalid() {
        assert!(ObjectId::from_hex("abc").is_err());
        assert!(ObjectId::from_hex(&"z".repeat(40)).is_err());
        assert!(ObjectId::from_hex_with(HashAlgorithm::Sha256, &"a".repeat(40)).is_err());
        assert!(ObjectId::from_raw(HashAlgorithm::Sha1, &[0u8; 32]).is_err());
    }

    #[test]
    fn test_is_hex() {
        assert!(ObjectId::is_hex(HashAlgorithm::Sha1, &"0f".repeat(20)));
        assert!(!ObjectId::is_hex(HashAlgorithm::Sha1, &"0f".repeat(32)));
        assert!(!ObjectId::is_hex(HashAlgorithm::Sha1, "refs/heads/main"));
        assert!(!ObjectId::is_hex(HashAlgorithm::Sha1, &"g".repeat(40)));
    }

    #[test]
    fn test_blob_hash() {
        let obj = GitObject::blob(HashAlgorithm::Sha1, b"hello\n".to_vec());
        assert_eq!(obj.id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn test_empty_blob_hash() {
        let obj = GitObject::blob(HashAlgorithm::Sha1, Vec::new());
        assert_eq!(obj.id.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");
    }

    #[test]
    fn test_empty_tree_hash() {
        let sha1 = GitObject::tree(HashAlgorithm::Sha1, &[]);
        assert_eq!(sha1.id.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");

        let sha256 = GitObject::tree(HashAlgorithm::Sha256, &[]);
        assert_eq!(
            sha256.id.to_hex(),
            "6ef19b41225c5369f1c104d45d8d85efa9b057b53b14b4b9b939dd74decc5321"
        );
    }

    #[test]
    fn test_hasher_matches_hash_object() {
        let mut hasher = ObjectHasher::for_object(HashAlgorithm::Sha256, ObjectKind::Blob, 11);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(
            hasher.finish(),
            ObjectId::hash_object(HashAlgorithm::Sha256, ObjectKind::Blob, b"hello world")
        );
    }

    #[test]
    fn test_object_kind_pack_type_roundtrip() {
        for kind in [
            ObjectKind::Commit,
            ObjectKind::Tree,
            ObjectKind::Blob,
            ObjectKind::Tag,
            ObjectKind::OfsDelta,
            ObjectKind::RefDelta,
        ] {
            assert_eq!(ObjectKind::from_pack_type(kind.pack_type()).unwrap(), kind);
        }
    }

    #[test]
    fn test_object_kind_from_pack_type_invalid() {
        assert!(ObjectKind::from_pack_type(0).is_err());
        assert!(ObjectKind::from_pack_type(5).is_err());
        assert!(ObjectKind::from_pack_type(8).is_err());
    }

    #[test]
    fn test_git_object_commit() {
        let tree_id = ObjectId::Sha1([1u8; 20]);
        let parent = ObjectId::Sha1([2u8; 20]);
        let obj = GitObject::commit(
            HashAlgorithm::Sha1,
            &tree_id,
            &[parent],
            "Alice <alice@example.com> 1234567890 +0000",
            "Bob <bob@example.com> 1234567890 +0000",
            "Initial commit",
        );

        assert_eq!(obj.kind, ObjectKind::Commit);
        let content = String::from_utf8_lossy(&obj.data);
        assert!(content.contains(&format!("tree {}", tree_id)));
        assert!(content.contains(&format!("parent {}", parent)));
    }

    #[test]
    fn test_null_id() {
        assert!(HashAlgorithm::Sha1.null_id().is_null());
        assert_eq!(HashAlgorithm::Sha256.null_id().to_hex(), "0".repeat(64));
    }

    #[test]
    fn test_object_id_serialization() {
        let id = ObjectId::Sha1([0xab; 20]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
