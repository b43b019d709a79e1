//! Builds the flat path index from pack objects in any arrival order.
//!
//! A tree can arrive before anything refers to it, and a commit or parent
//! tree can arrive before the trees it names. The assembler stashes tree
//! bodies until a path is known for them, and remembers paths until their
//! tree body shows up.

use chrono::{DateTime, FixedOffset};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use tipfs_git::{GitError, ObjectId, PackObject, TreeEntry};
use tracing::{debug, trace, warn};

/// Path of the root directory.
pub const ROOT: &str = "/";

/// One entry of the flat index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualNode {
    /// Blob or tree id.
    pub id: ObjectId,
    /// Whether this is a directory.
    pub is_directory: bool,
}

/// The commit a tree was assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipCommit {
    /// Commit id.
    pub id: ObjectId,
    /// Root tree id.
    pub tree: ObjectId,
    /// Latest author or committer time.
    pub last_modified: Option<DateTime<FixedOffset>>,
}

/// Normalizes a path to the index form: a leading `/`, no trailing or
/// doubled slashes. An empty path is the root.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Returns the last segment of a normalized path, or "" for the root.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// A single path segment: not empty, not `.` or `..`, and free of `/`.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Reconciles pack objects into a [`TreeIndex`].
pub struct TreeAssembler {
    tip: ObjectId,
    commit: Option<TipCommit>,
    available: HashMap<ObjectId, Vec<TreeEntry>>,
    needed: HashMap<ObjectId, Vec<String>>,
    nodes: BTreeMap<String, VirtualNode>,
    blob_sizes: HashMap<ObjectId, u64>,
}

impl TreeAssembler {
    /// Starts assembling the tree of commit `tip`.
    pub fn new(tip: ObjectId) -> Self {
        Self {
            tip,
            commit: None,
            available: HashMap::new(),
            needed: HashMap::new(),
            nodes: BTreeMap::new(),
            blob_sizes: HashMap::new(),
        }
    }

    /// Feeds one decoded pack object.
    pub fn add(&mut self, object: PackObject) {
        match object {
            PackObject::Commit { id, info } if id == self.tip => {
                debug!(commit = %id, tree = %info.tree, "found tip commit");
                self.nodes.insert(
                    ROOT.to_string(),
                    VirtualNode {
                        id: info.tree,
                        is_directory: true,
                    },
                );
                self.commit = Some(TipCommit {
                    id,
                    tree: info.tree,
                    last_modified: info.last_modified,
                });
                self.resolve(info.tree, ROOT.to_string());
            }
            PackObject::Commit { id, .. } => {
                trace!(commit = %id, "ignoring commit other than the tip");
            }
            PackObject::Tree { id, entries } => {
                self.available.insert(id, entries);
                if let Some(paths) = self.needed.remove(&id) {
                    for path in paths {
                        self.resolve(id, path);
                    }
                }
            }
            PackObject::Blob { id, size } => {
                self.blob_sizes.insert(id, size);
            }
            PackObject::Skipped { .. } => {}
        }
    }

    /// Flattens tree `id` under `path`, or records that `path` waits on it.
    fn resolve(&mut self, id: ObjectId, path: String) {
        let mut pending = vec![(id, path)];
        while let Some((id, path)) = pending.pop() {
            let Some(entries) = self.available.get(&id) else {
                trace!(tree = %id, path = %path, "tree not seen yet");
                self.needed.entry(id).or_default().push(path);
                continue;
            };
            for entry in entries {
                if !is_valid_name(&entry.name) {
                    warn!(tree = %id, name = ?entry.name, "skipping tree entry with invalid name");
                    continue;
                }
                let child = join(&path, &entry.name);
                // First writer wins.
                if let Entry::Vacant(slot) = self.nodes.entry(child.clone()) {
                    slot.insert(VirtualNode {
                        id: entry.id,
                        is_directory: entry.is_directory(),
                    });
                    if entry.is_directory() {
                        pending.push((entry.id, child));
                    }
                }
            }
        }
    }

    /// Finishes assembly.
    ///
    /// Fails if the tip commit never arrived. Trees that were referenced but
    /// never received are logged and left out.
    pub fn finish(self) -> tipfs_git::Result<TreeIndex> {
        let commit = self.commit.ok_or_else(|| {
            GitError::InvalidPack(format!("pack did not contain commit {}", self.tip))
        })?;

        for (id, paths) in &self.needed {
            warn!(tree = %id, paths = ?paths, "tree referenced but never received");
        }

        Ok(TreeIndex {
            commit,
            nodes: self.nodes,
            blob_sizes: self.blob_sizes,
        })
    }
}

/// The assembled path index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeIndex {
    commit: TipCommit,
    nodes: BTreeMap<String, VirtualNode>,
    blob_sizes: HashMap<ObjectId, u64>,
}

impl TreeIndex {
    /// The commit this index was built from.
    pub fn commit(&self) -> &TipCommit {
        &self.commit
    }

    /// Looks up a path.
    pub fn get(&self, path: &str) -> Option<&VirtualNode> {
        self.nodes.get(&normalize_path(path))
    }

    /// Lists the immediate children of a directory, in path order.
    pub fn children(&self, path: &str) -> Vec<(&str, &VirtualNode)> {
        let dir = normalize_path(path);
        let prefix = if dir == ROOT { dir } else { format!("{}/", dir) };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| key.len() > prefix.len() && !key[prefix.len()..].contains('/'))
            .map(|(key, node)| (key.as_str(), node))
            .collect()
    }

    /// Size of a blob seen in the initial pack.
    pub fn blob_size(&self, id: &ObjectId) -> Option<u64> {
        self.blob_sizes.get(id).copied()
    }

    /// Every indexed path with its node, in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VirtualNode)> {
        self.nodes.iter().map(|(path, node)| (path.as_str(), node))
    }

    /// Number of indexed paths, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing was indexed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use tipfs_git::{CommitInfo, GitObject, HashAlgorithm};

    const SHA1: HashAlgorithm = HashAlgorithm::Sha1;

    /// A commit over a small nested tree, as pack objects.
    fn objects() -> (ObjectId, Vec<PackObject>) {
        let mut objects = Vec::new();
        let mut tree = |entries: Vec<TreeEntry>| {
            let id = GitObject::tree(SHA1, &entries).id;
            objects.push(PackObject::Tree { id, entries });
            id
        };

        let blob = |s: &str| GitObject::blob(SHA1, s.as_bytes().to_vec()).id;
        let leaf = tree(vec![TreeEntry::file("leaf.txt", blob("leaf"))]);
        let mid = tree(vec![
            TreeEntry::directory("leaf", leaf),
            TreeEntry::file("mid.txt", blob("mid")),
        ]);
        let other = tree(vec![TreeEntry::file("other.txt", blob("other"))]);
        let root = tree(vec![
            TreeEntry::directory("a", mid),
            TreeEntry::directory("b", other),
            TreeEntry::directory("c", leaf),
            TreeEntry::file("top.txt", blob("top")),
        ]);

        let tip = ObjectId::Sha1([0xaa; 20]);
        objects.push(PackObject::Commit {
            id: tip,
            info: CommitInfo {
                tree: root,
                parents: Vec::new(),
                last_modified: None,
            },
        });
        (tip, objects)
    }

    fn assemble(tip: ObjectId, objects: Vec<PackObject>) -> TreeIndex {
        let mut assembler = TreeAssembler::new(tip);
        for object in objects {
            assembler.add(object);
        }
        assembler.finish().unwrap()
    }

    proptest! {
        /// Property: the index does not depend on arrival order
        #[test]
        fn prop_order_independent(shuffled in Just(objects().1).prop_shuffle()) {
            let (tip, objects) = objects();
            let expected = assemble(tip, objects);
            prop_assert_eq!(expected.len(), 10);
            prop_assert_eq!(assemble(tip, shuffled), expected);
        }
    }
}
