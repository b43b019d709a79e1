//! An in-memory git remote for testing.
//!
//! Speaks enough of the smart protocol to serve shallow fetches and single
//! object requests, and counts how often it is asked.

use crate::transport::{ByteStream, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tipfs_git::{
    parse_commit, parse_tree, write_advertisement, AdvertisedRef, GitObject, HashAlgorithm,
    ObjectId, ObjectKind, PackBuilder, PktLineWriter, ServerCapabilities, TreeEntry,
    UploadRequest,
};
use tokio_util::io::StreamReader;

const AGENT: &str = "tipfs-memory/0.1.0";

/// An in-memory smart-protocol remote.
pub struct MemoryRemote {
    algorithm: HashAlgorithm,
    objects: RwLock<HashMap<ObjectId, GitObject>>,
    refs: RwLock<BTreeMap<String, ObjectId>>,
    filter: bool,
    advertise_on_upload: bool,
    reverse_pack: bool,
    truncate_pack_at: Option<usize>,
    stream_failure: Option<(usize, io::ErrorKind)>,
    unreachable: bool,
    latency: Option<Duration>,
    info_refs_calls: AtomicUsize,
    upload_pack_calls: AtomicUsize,
    requests: Mutex<Vec<UploadRequest>>,
}

impl MemoryRemote {
    /// Creates an empty remote using `algorithm` for object ids.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            objects: RwLock::new(HashMap::new()),
            refs: RwLock::new(BTreeMap::new()),
            filter: false,
            advertise_on_upload: false,
            reverse_pack: false,
            truncate_pack_at: None,
            stream_failure: None,
            unreachable: false,
            latency: None,
            info_refs_calls: AtomicUsize::new(0),
            upload_pack_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Advertises `filter` and honours `filter blob:none`.
    pub fn with_filter(mut self, filter: bool) -> Self {
        self.filter = filter;
        self
    }

    /// Replays the ref advertisement ahead of every upload-pack reply, the
    /// way an SSH session does.
    pub fn with_advertisement_on_upload(mut self) -> Self {
        self.advertise_on_upload = true;
        self
    }

    /// Sends pack entries in reverse order: blobs, then trees bottom-up,
    /// then the commit.
    pub fn with_reversed_pack(mut self) -> Self {
        self.reverse_pack = true;
        self
    }

    /// Cuts every pack `len` bytes after its `PACK` signature starts.
    pub fn with_pack_truncated_at(mut self, len: usize) -> Self {
        self.truncate_pack_at = Some(len);
        self
    }

    /// Drops the last `tail` bytes of every upload-pack reply and ends the
    /// stream with an error of `kind` in their place.
    pub fn with_stream_failure(mut self, tail: usize, kind: io::ErrorKind) -> Self {
        self.stream_failure = Some((tail, kind));
        self
    }

    /// Fails every request with a connection error.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Delays every upload-pack reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Returns the hash algorithm of this remote.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Stores an object and returns its id.
    pub fn insert(&self, object: GitObject) -> ObjectId {
        let id = object.id;
        self.objects.write().insert(id, object);
        id
    }

    /// Stores a blob and returns its id.
    pub fn insert_blob(&self, content: impl Into<Bytes>) -> ObjectId {
        self.insert(GitObject::blob(self.algorithm, content))
    }

    /// Stores a tree with the given entries and returns its id.
    pub fn insert_tree(&self, entries: &[TreeEntry]) -> ObjectId {
        self.insert(GitObject::tree(self.algorithm, entries))
    }

    /// Stores the blobs and nested trees for `files` (slash separated paths)
    /// and returns the root tree id.
    pub fn insert_files(&self, files: &[(&str, &[u8])]) -> ObjectId {
        #[derive(Default)]
        struct Dir {
            files: Vec<(String, ObjectId)>,
            dirs: BTreeMap<String, Dir>,
        }

        fn write(remote: &MemoryRemote, dir: &Dir) -> ObjectId {
            let mut entries: Vec<TreeEntry> = dir
                .files
                .iter()
                .map(|(name, id)| TreeEntry::file(name.clone(), *id))
                .collect();
            for (name, child) in &dir.dirs {
                entries.push(TreeEntry::directory(name.clone(), write(remote, child)));
            }
            remote.insert_tree(&entries)
        }

        let mut root = Dir::default();
        for (path, content) in files {
            let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            if let Some((file, parents)) = segments.split_last() {
                let mut dir = &mut root;
                for segment in parents {
                    dir = dir.dirs.entry(segment.to_string()).or_default();
                }
                let blob = self.insert_blob(content.to_vec());
                dir.files.push((file.to_string(), blob));
            }
        }
        write(self, &root)
    }

    /// Stores a commit of `tree` and returns its id.
    pub fn commit(&self, tree: ObjectId, parents: &[ObjectId], timestamp: i64) -> ObjectId {
        let signature = format!("Test <test@example.com> {} +0000", timestamp);
        self.insert(GitObject::commit(
            self.algorithm,
            &tree,
            parents,
            &signature,
            &signature,
            "commit\n",
        ))
    }

    /// Points `name` at `id`.
    pub fn set_ref(&self, name: impl Into<String>, id: ObjectId) {
        self.refs.write().insert(name.into(), id);
    }

    /// Number of ref advertisements served.
    pub fn info_refs_calls(&self) -> usize {
        self.info_refs_calls.load(Ordering::SeqCst)
    }

    /// Number of upload-pack requests served.
    pub fn upload_pack_calls(&self) -> usize {
        self.upload_pack_calls.load(Ordering::SeqCst)
    }

    /// Upload-pack requests received so far, in order.
    pub fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().clone()
    }

    fn capabilities(&self) -> ServerCapabilities {
        let caps = ServerCapabilities::new(self.algorithm, self.filter);
        let refs = self.refs.read();
        let head = refs.get("HEAD");
        let target = refs
            .iter()
            .find(|(name, id)| name.starts_with("refs/heads/") && Some(*id) == head)
            .map(|(name, _)| name.clone());
        match target {
            Some(target) => caps.with_symref_head(target).with_agent(AGENT),
            None => caps.with_agent(AGENT),
        }
    }

    fn advertised_refs(&self) -> Vec<AdvertisedRef> {
        let refs = self.refs.read();
        let head = refs.get("HEAD").map(|id| AdvertisedRef::new(*id, "HEAD"));
        head.into_iter()
            .chain(
                refs.iter()
                    .filter(|(name, _)| name.as_str() != "HEAD")
                    .map(|(name, id)| AdvertisedRef::new(*id, name.clone())),
            )
            .collect()
    }

    fn advertisement(&self, service: Option<&str>) -> tipfs_git::Result<Vec<u8>> {
        let mut output = Vec::new();
        write_advertisement(
            &mut output,
            &self.advertised_refs(),
            &self.capabilities(),
            service,
        )?;
        Ok(output)
    }

    /// Collects `want` and what it reaches, commit first, trees before blobs.
    ///
    /// Parents are followed only when `depth` is unbounded. A blob asked
    /// for by name is sent even when blobs are filtered.
    fn collect(
        &self,
        want: ObjectId,
        depth: Option<u32>,
        blobs: bool,
    ) -> tipfs_git::Result<Vec<GitObject>> {
        let objects = self.objects.read();
        let mut seen = HashSet::new();
        let mut commits = Vec::new();
        let mut trees = Vec::new();
        let mut blob_objects = Vec::new();
        let mut pending = vec![want];

        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(object) = objects.get(&id) else {
                continue;
            };
            match object.kind {
                ObjectKind::Commit => {
                    let info = parse_commit(self.algorithm, &object.data)?;
                    pending.push(info.tree);
                    if depth.is_none() {
                        pending.extend(info.parents);
                    }
                    commits.push(object.clone());
                }
                ObjectKind::Tree => {
                    for entry in parse_tree(self.algorithm, &object.data)? {
                        pending.push(entry.id);
                    }
                    trees.push(object.clone());
                }
                ObjectKind::Blob if blobs || id == want => blob_objects.push(object.clone()),
                _ => {}
            }
        }

        let mut ordered = commits;
        ordered.extend(trees);
        ordered.extend(blob_objects);
        if self.reverse_pack {
            ordered.reverse();
        }
        Ok(ordered)
    }

    fn respond(&self, request: &UploadRequest) -> tipfs_git::Result<Vec<u8>> {
        let mut output = Vec::new();
        if self.advertise_on_upload {
            output.extend(self.advertisement(None)?);
        }

        let mut writer = PktLineWriter::new(&mut output);
        let unknown = request
            .wants
            .iter()
            .find(|id| !self.objects.read().contains_key(id));
        if let Some(id) = unknown {
            writer.write_line(&format!("ERR upload-pack: not our ref {}", id))?;
            return Ok(output);
        }

        if request.depth.is_some() {
            for id in &request.wants {
                writer.write_line(&format!("shallow {}", id))?;
            }
            writer.flush_pkt()?;
        }
        writer.write_line("NAK")?;

        let blobs = !(self.filter && request.filter.as_deref() == Some("blob:none"));
        let mut builder = PackBuilder::new(self.algorithm);
        let mut sent = HashSet::new();
        for want in &request.wants {
            for object in self.collect(*want, request.depth, blobs)? {
                if sent.insert(object.id) {
                    builder.add(object);
                }
            }
        }
        let mut pack = builder.build()?;
        if let Some(len) = self.truncate_pack_at {
            pack.truncate(len);
        }
        output.extend(pack);
        Ok(output)
    }
}

fn connection_refused() -> TransportError {
    Box::new(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "memory remote is unreachable",
    ))
}

#[async_trait]
impl Transport for MemoryRemote {
    async fn info_refs(&self) -> Result<ByteStream, TransportError> {
        self.info_refs_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(connection_refused());
        }
        let body = self.advertisement(Some("git-upload-pack"))?;
        Ok(Box::new(Cursor::new(body)))
    }

    async fn upload_pack(&self, request: Bytes) -> Result<ByteStream, TransportError> {
        self.upload_pack_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(connection_refused());
        }
        let parsed = UploadRequest::parse(&request[..]).await?;
        self.requests.lock().push(parsed.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut body = self.respond(&parsed)?;
        match self.stream_failure {
            Some((tail, kind)) => {
                body.truncate(body.len().saturating_sub(tail));
                let chunks = vec![
                    Ok(Bytes::from(body)),
                    Err(io::Error::new(kind, "memory remote dropped the connection")),
                ];
                Ok(Box::new(StreamReader::new(stream::iter(chunks))))
            }
            None => Ok(Box::new(Cursor::new(body))),
        }
    }
}
