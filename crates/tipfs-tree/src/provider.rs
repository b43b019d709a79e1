//! The read-only tree over a remote's tip commit.
//!
//! Population (ref negotiation, the depth-1 fetch and pack decoding) runs
//! once on a background task. Every lookup waits for it and then sees either
//! the complete index or the population error, never a partial view. Blob
//! content is fetched per object on demand.

use crate::assembler::{file_name, normalize_path, TipCommit, TreeAssembler, TreeIndex, VirtualNode};
use crate::stream::{BlobReader, TransportStream};
use crate::transport::Transport;
use crate::watch::ChangeToken;
use crate::{Error, RemoteConfig, Result};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tipfs_git::{FetchRequest, GitError, ObjectId, PackReader, PktLineReader, RefAdvertisement};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

type PopulateResult = std::result::Result<Arc<TreeIndex>, Arc<Error>>;
type LengthResult = std::result::Result<u64, Arc<Error>>;

/// Describes one path of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Normalized absolute path.
    pub path: String,
    /// Last path segment; empty for the root.
    pub name: String,
    /// Blob or tree id.
    pub id: Option<ObjectId>,
    /// False for paths that are not in the tree.
    pub exists: bool,
    /// Whether this is a directory.
    pub is_directory: bool,
    /// Time of the tip commit; the same for every path.
    pub last_modified: Option<DateTime<FixedOffset>>,
}

impl Node {
    /// A node for a path that does not exist.
    pub fn not_found(path: &str) -> Self {
        let path = normalize_path(path);
        Self {
            name: file_name(&path).to_string(),
            path,
            id: None,
            exists: false,
            is_directory: false,
            last_modified: None,
        }
    }

    fn from_index(index: &TreeIndex, path: &str, node: &VirtualNode) -> Self {
        Self {
            path: path.to_string(),
            name: file_name(path).to_string(),
            id: Some(node.id),
            exists: true,
            is_directory: node.is_directory,
            last_modified: index.commit().last_modified,
        }
    }
}

/// The children of a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryListing {
    /// False if the path is missing or is not a directory.
    pub exists: bool,
    /// Immediate children in path order.
    pub entries: Vec<Node>,
}

impl DirectoryListing {
    /// The listing of a path that is not a directory.
    pub fn not_found() -> Self {
        Self::default()
    }
}

/// Fetches and parses the remote's ref advertisement.
pub async fn fetch_advertisement<T: Transport + ?Sized>(transport: &T) -> Result<RefAdvertisement> {
    let stream = transport.info_refs().await.map_err(Error::Transport)?;
    let mut reader = PktLineReader::new(TransportStream::new(stream, CancellationToken::new()));
    Ok(RefAdvertisement::read(&mut reader).await?)
}

/// Requests a single blob and returns a reader over its content.
pub async fn fetch_blob<T: Transport + ?Sized>(transport: &T, id: ObjectId) -> Result<BlobReader> {
    open_blob(transport, id, CancellationToken::new()).await
}

async fn open_blob<T: Transport + ?Sized>(
    transport: &T,
    id: ObjectId,
    cancel: CancellationToken,
) -> Result<BlobReader> {
    let request = FetchRequest::object(id).encode()?;
    let stream = transport
        .upload_pack(Bytes::from(request))
        .await
        .map_err(Error::Transport)?;
    let mut reader = PktLineReader::new(TransportStream::new(stream, cancel.clone()));
    reader.skip_to_pack().await?;
    let pack = PackReader::new(BufReader::new(reader.into_pack_stream()), id.algorithm()).await?;
    Ok(BlobReader::new(pack.into_blob(id).await?, cancel))
}

struct Inner {
    transport: Box<dyn Transport>,
    config: RemoteConfig,
    cancel: CancellationToken,
    population: OnceLock<Shared<BoxFuture<'static, PopulateResult>>>,
    lengths: RwLock<HashMap<ObjectId, u64>>,
    length_fetches: Mutex<HashMap<ObjectId, Shared<BoxFuture<'static, LengthResult>>>>,
}

/// A read-only file tree over the tip commit of a remote reference.
///
/// Cheap to clone; clones share the index, caches and cancellation.
#[derive(Clone)]
pub struct RemoteTree {
    inner: Arc<Inner>,
}

impl RemoteTree {
    /// Creates a tree. Nothing is fetched until the first lookup.
    pub fn new<T: Transport + 'static>(transport: T, config: RemoteConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport: Box::new(transport),
                config,
                cancel: CancellationToken::new(),
                population: OnceLock::new(),
                lengths: RwLock::new(HashMap::new()),
                length_fetches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a tree and waits for it to populate.
    pub async fn open<T: Transport + 'static>(transport: T, config: RemoteConfig) -> Result<Self> {
        let tree = Self::new(transport, config);
        tree.populate().await?;
        Ok(tree)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RemoteConfig {
        &self.inner.config
    }

    /// Starts population if needed and waits for it.
    ///
    /// Population runs once per tree; later calls return the first result.
    pub async fn populate(&self) -> Result<()> {
        self.index().await.map(|_| ())
    }

    /// Cancels population and blob fetches that are still running.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// The resolved tip commit.
    pub async fn commit(&self) -> Result<TipCommit> {
        Ok(self.index().await?.commit().clone())
    }

    /// Lists the immediate children of a directory.
    ///
    /// Missing paths, files, and a tree that failed to populate all give a
    /// listing that does not exist.
    pub async fn list_directory(&self, path: &str) -> DirectoryListing {
        let Some(index) = self.index_or_log(path).await else {
            return DirectoryListing::not_found();
        };
        match index.get(path) {
            Some(node) if node.is_directory => DirectoryListing {
                exists: true,
                entries: index
                    .children(path)
                    .into_iter()
                    .map(|(child, node)| Node::from_index(&index, child, node))
                    .collect(),
            },
            _ => DirectoryListing::not_found(),
        }
    }

    /// Describes one path.
    pub async fn get_node(&self, path: &str) -> Node {
        let Some(index) = self.index_or_log(path).await else {
            return Node::not_found(path);
        };
        let normalized = normalize_path(path);
        match index.get(&normalized) {
            Some(node) => Node::from_index(&index, &normalized, node),
            None => Node::not_found(&normalized),
        }
    }

    /// Returns a change token for `path`. It never fires.
    pub fn watch(&self, path: &str) -> ChangeToken {
        debug!(path, "watch requested on a snapshot tree");
        ChangeToken
    }

    /// Length of the file at `path`, or None for directories and missing
    /// paths.
    pub async fn length(&self, path: &str) -> Result<Option<u64>> {
        let index = self.index().await?;
        match index.get(path) {
            Some(node) if !node.is_directory => self.resolve_length(&index, node.id).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Opens the file at `path`, or returns None for directories and missing
    /// paths.
    pub async fn read(&self, path: &str) -> Result<Option<BlobReader>> {
        let index = self.index().await?;
        match index.get(path) {
            Some(node) if !node.is_directory => self.read_blob(node.id).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Length of a blob.
    ///
    /// Served from the initial pack when the blob was in it. Otherwise the
    /// blob is fetched and drained once, however many callers ask at the
    /// same time, and the result is cached.
    pub async fn blob_length(&self, id: ObjectId) -> Result<u64> {
        let index = self.index().await?;
        self.resolve_length(&index, id).await
    }

    /// Fetches a blob's content.
    ///
    /// Reads from the returned reader fail once the tree is cancelled.
    pub async fn read_blob(&self, id: ObjectId) -> Result<BlobReader> {
        let span = info_span!("read_blob", blob = %id);
        let cancel = self.inner.cancel.clone();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(Error::Cancelled),
            reader = open_blob(&*self.inner.transport, id, cancel).instrument(span) => reader,
        }
    }

    async fn index(&self) -> Result<Arc<TreeIndex>> {
        self.population().await.map_err(Error::Population)
    }

    async fn index_or_log(&self, path: &str) -> Option<Arc<TreeIndex>> {
        match self.index().await {
            Ok(index) => Some(index),
            Err(err) => {
                debug!(path, error = %err, "tree unavailable; reporting not found");
                None
            }
        }
    }

    fn population(&self) -> Shared<BoxFuture<'static, PopulateResult>> {
        self.inner
            .population
            .get_or_init(|| {
                let inner = Arc::clone(&self.inner);
                let span = info_span!("populate", reference = %inner.config.reference);
                let task = tokio::spawn(
                    async move {
                        let result = tokio::select! {
                            _ = inner.cancel.cancelled() => Err(Error::Cancelled),
                            result = populate(&inner) => result,
                        };
                        result.map(Arc::new).map_err(Arc::new)
                    }
                    .instrument(span),
                );
                async move {
                    match task.await {
                        Ok(result) => result,
                        Err(err) => Err(Arc::new(Error::Task(err))),
                    }
                }
                .boxed()
                .shared()
            })
            .clone()
    }

    async fn resolve_length(&self, index: &TreeIndex, id: ObjectId) -> Result<u64> {
        if let Some(size) = index.blob_size(&id) {
            return Ok(size);
        }
        if let Some(size) = self.cached_length(&id) {
            return Ok(size);
        }

        let fetch = {
            let mut fetches = self.inner.length_fetches.lock();
            // A fetch may have finished between the check above and the lock.
            if let Some(size) = self.cached_length(&id) {
                return Ok(size);
            }
            fetches
                .entry(id)
                .or_insert_with(|| {
                    let inner = Arc::clone(&self.inner);
                    async move {
                        let result = fetch_length(&inner, id).await.map_err(Arc::new);
                        if let Ok(size) = &result {
                            inner.lengths.write().insert(id, *size);
                        }
                        inner.length_fetches.lock().remove(&id);
                        result
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        fetch.await.map_err(Error::Shared)
    }

    fn cached_length(&self, id: &ObjectId) -> Option<u64> {
        self.inner.lengths.read().get(id).copied()
    }
}

async fn populate(inner: &Inner) -> Result<TreeIndex> {
    let advertisement = fetch_advertisement(&*inner.transport).await?;
    let reference = &inner.config.reference;
    let tip = advertisement
        .resolve(reference)
        .ok_or_else(|| Error::ReferenceNotFound(reference.clone()))?;

    let filter = inner.config.use_filter && advertisement.capabilities.filter;
    debug!(commit = %tip, filter, "requesting tip commit");
    let request = FetchRequest::shallow(tip, filter).encode()?;
    let stream = inner
        .transport
        .upload_pack(Bytes::from(request))
        .await
        .map_err(Error::Transport)?;

    let mut reader = PktLineReader::new(TransportStream::new(stream, inner.cancel.clone()));
    reader.skip_to_pack().await?;
    let mut pack = PackReader::new(
        BufReader::new(reader.into_pack_stream()),
        advertisement.algorithm(),
    )
    .await?;

    let mut assembler = TreeAssembler::new(tip);
    while let Some(object) = pack.next_object().await? {
        if inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        assembler.add(object);
    }

    let index = assembler.finish()?;
    info!(
        commit = %tip,
        objects = pack.header().object_count,
        nodes = index.len(),
        "populated remote tree"
    );
    Ok(index)
}

async fn fetch_length(inner: &Inner, id: ObjectId) -> Result<u64> {
    let fetch = async {
        let mut reader = open_blob(&*inner.transport, id, inner.cancel.clone()).await?;
        let size = tokio::io::copy(&mut reader, &mut tokio::io::sink())
            .await
            .map_err(GitError::from_pack_io)?;
        debug!(blob = %id, size, "resolved blob length");
        Ok(size)
    };
    tokio::select! {
        _ = inner.cancel.cancelled() => Err(Error::Cancelled),
        result = fetch.instrument(info_span!("blob_length", blob = %id)) => result,
    }
}
