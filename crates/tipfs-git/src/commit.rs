//! Commit object scanning.

use crate::{GitError, HashAlgorithm, ObjectId, Result};
use chrono::{DateTime, FixedOffset};
use tracing::trace;

/// What a checkout needs to know about a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Root tree of the commit.
    pub tree: ObjectId,
    /// Parent commits, in header order.
    pub parents: Vec<ObjectId>,
    /// Latest of the author and committer timestamps.
    pub last_modified: Option<DateTime<FixedOffset>>,
}

/// Scans the header block of a commit body.
///
/// Fails if the commit names no root tree. Signatures with an unparseable
/// timestamp are ignored rather than rejected.
pub fn parse_commit(algorithm: HashAlgorithm, body: &[u8]) -> Result<CommitInfo> {
    let text = String::from_utf8_lossy(body);
    let mut tree = None;
    let mut parents = Vec::new();
    let mut last_modified: Option<DateTime<FixedOffset>> = None;

    for line in text.lines() {
        if line.is_empty() {
            break; // End of headers
        }
        if let Some(hex) = line.strip_prefix("tree ") {
            tree = Some(ObjectId::from_hex_with(algorithm, hex.trim())?);
        } else if let Some(hex) = line.strip_prefix("parent ") {
            parents.push(ObjectId::from_hex_with(algorithm, hex.trim())?);
        } else if let Some(signature) = line
            .strip_prefix("committer ")
            .or_else(|| line.strip_prefix("author "))
        {
            match parse_signature_time(signature) {
                Some(time) => {
                    if last_modified.map_or(true, |current| time > current) {
                        last_modified = Some(time);
                    }
                }
                None => trace!(signature, "ignoring signature without a valid timestamp"),
            }
        }
    }

    let tree = tree.ok_or_else(|| GitError::InvalidObject("commit has no tree line".to_string()))?;
    Ok(CommitInfo {
        tree,
        parents,
        last_modified,
    })
}

/// Parses the trailing `<unix-seconds> <+HHMM>` of an author or committer line.
pub fn parse_signature_time(signature: &str) -> Option<DateTime<FixedOffset>> {
    let mut parts = signature.rsplitn(3, ' ');
    let zone = parts.next()?;
    let seconds: i64 = parts.next()?.parse().ok()?;

    let (sign, digits) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))?;

    DateTime::from_timestamp(seconds, 0).map(|utc| utc.with_timezone(&offset))
}
