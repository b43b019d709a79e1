//! Tree object parsing.
//!
//! A tree body is a sequence of `<octal mode> SP <name> NUL <raw id>` records.
//! Only regular files and directories are surfaced; symlinks and submodules
//! are stepped over.

use crate::{GitError, HashAlgorithm, ObjectId, Result};
use tracing::trace;

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_DIRECTORY: u32 = 0o040000;
const MODE_FILE: u32 = 0o100000;

/// Default mode for a regular file.
pub const FILE_MODE: u32 = 0o100644;
/// Mode for an executable file.
pub const EXECUTABLE_MODE: u32 = 0o100755;
/// Mode for a subdirectory.
pub const DIRECTORY_MODE: u32 = 0o040000;

/// Whether a tree entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Regular or executable file.
    File,
    /// Subdirectory (another tree).
    Directory,
}

/// One file or directory entry of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeEntry {
    /// File or directory.
    pub kind: EntryKind,
    /// Raw mode bits as written in the tree.
    pub mode: u32,
    /// Entry name (a single path segment).
    pub name: String,
    /// Id of the blob or tree.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Creates a regular file entry.
    pub fn file(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            kind: EntryKind::File,
            mode: FILE_MODE,
            name: name.into(),
            id,
        }
    }

    /// Creates a subdirectory entry.
    pub fn directory(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            kind: EntryKind::Directory,
            mode: DIRECTORY_MODE,
            name: name.into(),
            id,
        }
    }

    /// Returns true for directory entries.
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Parses a tree body into its file and directory entries, in tree order.
pub fn parse_tree(algorithm: HashAlgorithm, body: &[u8]) -> Result<Vec<TreeEntry>> {
    let id_len = algorithm.raw_len();
    let mut entries = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        let space = body[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| GitError::InvalidObject(format!("tree entry at {} has no mode", pos)))?;
        let mode_bytes = &body[pos..pos + space];
        let mode = parse_mode(mode_bytes)?;
        pos += space + 1;

        let nul = body[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| GitError::InvalidObject(format!("tree entry at {} has no name", pos)))?;
        let name = String::from_utf8_lossy(&body[pos..pos + nul]).into_owned();
        pos += nul + 1;

        if body.len() - pos < id_len {
            return Err(GitError::InvalidObject(format!(
                "tree entry {:?} truncated: expected {} id bytes, found {}",
                name,
                id_len,
                body.len() - pos
            )));
        }
        let id = ObjectId::from_raw(algorithm, &body[pos..pos + id_len])?;
        pos += id_len;

        let kind = match mode & MODE_TYPE_MASK {
            MODE_DIRECTORY => EntryKind::Directory,
            MODE_FILE => EntryKind::File,
            other => {
                trace!(name = %name, mode = %format!("{:o}", other), "skipping tree entry");
                continue;
            }
        };
        entries.push(TreeEntry {
            kind,
            mode,
            name,
            id,
        });
    }

    Ok(entries)
}

fn parse_mode(bytes: &[u8]) -> Result<u32> {
    if bytes.is_empty() || !bytes.iter().all(|b| (b'0'..=b'7').contains(b)) {
        return Err(GitError::InvalidObject(format!(
            "invalid tree entry mode {:?}",
            String::from_utf8_lossy(bytes)
        )));
    }
    bytes.iter().try_fold(0u32, |acc, &b| {
        acc.checked_mul(8)
            .and_then(|acc| acc.checked_add(u32::from(b - b'0')))
            .ok_or_else(|| GitError::InvalidObject("tree entry mode overflows".to_string()))
    })
}

/// Serializes entries into a tree body, sorted the way git sorts them.
pub fn encode_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| sort_key(e));

    let mut data = Vec::new();
    for entry in sorted {
        data.extend_from_slice(format!("{:o} ", entry.mode).as_bytes());
        data.extend_from_slice(entry.name.as_bytes());
        data.push(0);
        data.extend_from_slice(entry.id.as_bytes());
    }
    data
}

// Directories compare as if their name ended in '/'.
fn sort_key(entry: &TreeEntry) -> Vec<u8> {
    let mut key = entry.name.as_bytes().to_vec();
    if entry.is_directory() {
        key.push(b'/');
    }
    key
}
