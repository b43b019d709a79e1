//! End-to-end tests for RemoteTree against the in-memory remote.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tipfs_git::{GitError, HashAlgorithm, ObjectId, ObjectKind};
use tipfs_tree::{
    ByteStream, Error, MemoryRemote, RemoteConfig, RemoteTree, Transport, TransportError,
};
use tokio::io::AsyncReadExt;

const TIMESTAMP: i64 = 1_700_000_000;

fn sample_remote(remote: MemoryRemote) -> (Arc<MemoryRemote>, ObjectId) {
    let tree = remote.insert_files(&[("a.txt", b"hi"), ("dir/b.txt", b"yo")]);
    let commit = remote.commit(tree, &[], TIMESTAMP);
    remote.set_ref("HEAD", commit);
    remote.set_ref("refs/heads/main", commit);
    (Arc::new(remote), commit)
}

fn sha1_remote() -> (Arc<MemoryRemote>, ObjectId) {
    sample_remote(MemoryRemote::new(HashAlgorithm::Sha1))
}

async fn read_all(tree: &RemoteTree, path: &str) -> Vec<u8> {
    let mut reader = tree.read(path).await.unwrap().unwrap();
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await.unwrap();
    content
}

async fn assert_sample_tree(tree: &RemoteTree) {
    let root = tree.list_directory("/").await;
    assert!(root.exists);
    let names: Vec<_> = root.entries.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "dir"]);
    assert!(!root.entries[0].is_directory);
    assert!(root.entries[1].is_directory);

    let dir = tree.list_directory("/dir").await;
    assert!(dir.exists);
    assert_eq!(dir.entries.len(), 1);
    assert_eq!(dir.entries[0].path, "/dir/b.txt");

    assert_eq!(tree.length("/a.txt").await.unwrap(), Some(2));
    assert_eq!(tree.length("/dir/b.txt").await.unwrap(), Some(2));
    assert_eq!(read_all(tree, "/a.txt").await, b"hi");
    assert_eq!(read_all(tree, "/dir/b.txt").await, b"yo");
}

/// Incompressible content, so a blob spans many reads.
fn noise(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9E37_79B9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

// ==================== Population ====================

#[tokio::test]
async fn test_lists_and_reads_tip_commit() {
    let (remote, commit) = sha1_remote();
    let tree = RemoteTree::open(remote.clone(), RemoteConfig::new("main"))
        .await
        .unwrap();

    assert_eq!(tree.commit().await.unwrap().id, commit);
    assert_sample_tree(&tree).await;

    let node = tree.get_node("dir/b.txt").await;
    assert!(node.exists);
    assert_eq!(node.name, "b.txt");
    let modified = node.last_modified.unwrap();
    assert_eq!(modified.timestamp(), TIMESTAMP);

    let root = tree.get_node("").await;
    assert!(root.exists);
    assert!(root.is_directory);
    assert_eq!(root.path, "/");
}

#[tokio::test]
async fn test_missing_paths() {
    let (remote, _) = sha1_remote();
    let tree = RemoteTree::new(remote, RemoteConfig::new("main"));

    assert!(!tree.get_node("/nope").await.exists);
    assert!(!tree.list_directory("/nope").await.exists);
    assert!(!tree.list_directory("/a.txt").await.exists);
    assert_eq!(tree.length("/nope").await.unwrap(), None);
    assert_eq!(tree.length("/dir").await.unwrap(), None);
    assert!(tree.read("/dir").await.unwrap().is_none());
}

#[tokio::test]
async fn test_default_reference_uses_first_advertised_ref() {
    let (remote, commit) = sha1_remote();
    let tree = RemoteTree::open(remote, RemoteConfig::default()).await.unwrap();
    assert_eq!(tree.commit().await.unwrap().id, commit);
}

#[tokio::test]
async fn test_explicit_commit_id() {
    let (remote, old) = sha1_remote();
    let newer_tree = remote.insert_files(&[("new.txt", b"new")]);
    let newer = remote.commit(newer_tree, &[old], TIMESTAMP + 60);
    remote.set_ref("HEAD", newer);
    remote.set_ref("refs/heads/main", newer);

    let tree = RemoteTree::open(remote, RemoteConfig::new(old.to_hex()))
        .await
        .unwrap();
    assert_eq!(tree.commit().await.unwrap().id, old);
    assert_sample_tree(&tree).await;
    assert!(!tree.get_node("/new.txt").await.exists);
}

#[tokio::test]
async fn test_request_is_depth_one() {
    let (remote, commit) = sha1_remote();
    let tree = RemoteTree::new(remote.clone(), RemoteConfig::new("main"));
    tree.populate().await.unwrap();

    let requests = remote.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].wants, vec![commit]);
    assert_eq!(requests[0].depth, Some(1));
    // The remote does not advertise filter support.
    assert_eq!(requests[0].filter, None);
    assert!(requests[0].done);
}

#[tokio::test]
async fn test_population_runs_once() {
    let (remote, _) = sha1_remote();
    let tree = RemoteTree::new(remote.clone(), RemoteConfig::new("main"));

    let (a, b, c) = tokio::join!(
        tree.list_directory("/"),
        tree.get_node("/a.txt"),
        tree.list_directory("/dir"),
    );
    assert!(a.exists && b.exists && c.exists);
    tree.populate().await.unwrap();

    assert_eq!(remote.info_refs_calls(), 1);
    assert_eq!(remote.upload_pack_calls(), 1);
}

#[tokio::test]
async fn test_reversed_pack_order() {
    let (remote, _) = sample_remote(MemoryRemote::new(HashAlgorithm::Sha1).with_reversed_pack());
    let tree = RemoteTree::open(remote, RemoteConfig::new("main")).await.unwrap();
    assert_sample_tree(&tree).await;
}

#[tokio::test]
async fn test_advertisement_before_pack() {
    let (remote, _) =
        sample_remote(MemoryRemote::new(HashAlgorithm::Sha1).with_advertisement_on_upload());
    let tree = RemoteTree::open(remote, RemoteConfig::new("refs/heads/main"))
        .await
        .unwrap();
    assert_sample_tree(&tree).await;
}

#[tokio::test]
async fn test_sha256_remote() {
    let (remote, commit) = sample_remote(MemoryRemote::new(HashAlgorithm::Sha256));
    let tree = RemoteTree::open(remote, RemoteConfig::new("main")).await.unwrap();

    assert_eq!(commit.algorithm(), HashAlgorithm::Sha256);
    assert_eq!(tree.commit().await.unwrap().id, commit);
    assert_eq!(tree.get_node("/a.txt").await.id.unwrap().to_hex().len(), 64);
    assert_sample_tree(&tree).await;
}

// ==================== Filtered fetches ====================

#[tokio::test]
async fn test_filter_fetches_lengths_lazily() {
    let (remote, _) = sample_remote(MemoryRemote::new(HashAlgorithm::Sha1).with_filter(true));
    let tree = RemoteTree::open(remote.clone(), RemoteConfig::new("main"))
        .await
        .unwrap();

    assert_eq!(remote.requests()[0].filter.as_deref(), Some("blob:none"));
    assert_eq!(remote.upload_pack_calls(), 1);

    assert_eq!(tree.length("/a.txt").await.unwrap(), Some(2));
    assert_eq!(remote.upload_pack_calls(), 2);

    // Cached from here on.
    assert_eq!(tree.length("/a.txt").await.unwrap(), Some(2));
    assert_eq!(remote.upload_pack_calls(), 2);

    assert_eq!(read_all(&tree, "/dir/b.txt").await, b"yo");
}

#[tokio::test]
async fn test_filter_disabled_by_config() {
    let (remote, _) = sample_remote(MemoryRemote::new(HashAlgorithm::Sha1).with_filter(true));
    let tree = RemoteTree::open(remote.clone(), RemoteConfig::new("main").with_filter(false))
        .await
        .unwrap();

    assert_eq!(remote.requests()[0].filter, None);
    assert_eq!(tree.length("/a.txt").await.unwrap(), Some(2));
    assert_eq!(remote.upload_pack_calls(), 1);
}

#[tokio::test]
async fn test_concurrent_lengths_share_one_fetch() {
    let (remote, _) = sample_remote(
        MemoryRemote::new(HashAlgorithm::Sha1)
            .with_filter(true)
            .with_latency(Duration::from_millis(50)),
    );
    let tree = RemoteTree::open(remote.clone(), RemoteConfig::new("main"))
        .await
        .unwrap();

    let lengths = futures::future::join_all((0..8).map(|_| tree.length("/a.txt"))).await;
    for length in lengths {
        assert_eq!(length.unwrap(), Some(2));
    }
    assert_eq!(remote.upload_pack_calls(), 2);
}

#[tokio::test]
async fn test_concurrent_lengths_across_tasks() {
    let (remote, _) = sample_remote(
        MemoryRemote::new(HashAlgorithm::Sha1)
            .with_filter(true)
            .with_latency(Duration::from_millis(50)),
    );
    let tree = RemoteTree::open(remote.clone(), RemoteConfig::new("main"))
        .await
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let tree = tree.clone();
            tokio::spawn(async move { tree.length("/dir/b.txt").await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), Some(2));
    }
    assert_eq!(remote.upload_pack_calls(), 2);
    assert_eq!(tree.length("/dir/b.txt").await.unwrap(), Some(2));
}

// ==================== Failures ====================

#[tokio::test]
async fn test_truncated_pack_is_format_error() {
    let (remote, _) =
        sample_remote(MemoryRemote::new(HashAlgorithm::Sha1).with_pack_truncated_at(13));
    let tree = RemoteTree::new(remote.clone(), RemoteConfig::new("main"));

    let err = tree.populate().await.unwrap_err();
    assert!(err.is_format_error(), "unexpected error: {}", err);
    assert!(matches!(err, Error::Population(_)));

    assert!(!tree.list_directory("/").await.exists);
    assert!(!tree.get_node("/a.txt").await.exists);
    assert!(tree.length("/a.txt").await.is_err());
    assert_eq!(remote.info_refs_calls(), 1);
}

#[tokio::test]
async fn test_missing_reference() {
    let (remote, _) = sha1_remote();
    let tree = RemoteTree::new(remote, RemoteConfig::new("refs/heads/missing"));

    let err = tree.populate().await.unwrap_err();
    assert!(matches!(err.root(), Error::ReferenceNotFound(name) if name == "refs/heads/missing"));
}

#[tokio::test]
async fn test_unreachable_remote() {
    let remote = Arc::new(MemoryRemote::new(HashAlgorithm::Sha1).unreachable());
    let tree = RemoteTree::new(remote.clone(), RemoteConfig::new("main"));

    assert!(!tree.list_directory("/").await.exists);
    assert!(!tree.get_node("/").await.exists);
    let err = tree.populate().await.unwrap_err();
    assert!(err.is_transport_error());
    assert_eq!(remote.info_refs_calls(), 1);
    assert_eq!(remote.upload_pack_calls(), 0);
}

#[tokio::test]
async fn test_unknown_blob_is_remote_error() {
    let (remote, _) = sha1_remote();
    let tree = RemoteTree::open(remote, RemoteConfig::new("main")).await.unwrap();
    let missing = ObjectId::hash_object(HashAlgorithm::Sha1, ObjectKind::Blob, b"absent");

    let err = tree.read_blob(missing).await.unwrap_err();
    assert!(matches!(err.root(), Error::Git(GitError::Remote(_))));
}

#[tokio::test]
async fn test_cancel_stops_population() {
    let (remote, _) = sample_remote(
        MemoryRemote::new(HashAlgorithm::Sha1).with_latency(Duration::from_millis(200)),
    );
    let tree = RemoteTree::new(remote, RemoteConfig::new("main"));
    tree.cancel();

    let err = tree.populate().await.unwrap_err();
    assert!(matches!(err.root(), Error::Cancelled));
}

#[tokio::test]
async fn test_stream_failure_mid_pack_is_transport_error() {
    let (remote, _) = sample_remote(
        MemoryRemote::new(HashAlgorithm::Sha1).with_stream_failure(40, io::ErrorKind::ConnectionReset),
    );
    let tree = RemoteTree::new(remote, RemoteConfig::new("main"));

    let err = tree.populate().await.unwrap_err();
    assert!(err.is_transport_error());
    assert!(!err.is_format_error());
    let Error::Transport(source) = err.root() else {
        panic!("expected a transport error, got {err:?}");
    };
    let source = source.downcast_ref::<io::Error>().unwrap();
    assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
}

#[tokio::test]
async fn test_stream_eof_error_is_not_a_format_error() {
    let (remote, _) = sample_remote(
        MemoryRemote::new(HashAlgorithm::Sha1).with_stream_failure(40, io::ErrorKind::UnexpectedEof),
    );
    let tree = RemoteTree::new(remote, RemoteConfig::new("main"));

    let err = tree.populate().await.unwrap_err();
    assert!(err.is_transport_error());
    assert!(!err.is_format_error());
}

/// Answers the first upload-pack request from `healthy` and every later one
/// from `failing`.
struct FailsAfterPopulation {
    healthy: Arc<MemoryRemote>,
    failing: Arc<MemoryRemote>,
    uploads: AtomicUsize,
}

#[async_trait]
impl Transport for FailsAfterPopulation {
    async fn info_refs(&self) -> Result<ByteStream, TransportError> {
        self.healthy.info_refs().await
    }

    async fn upload_pack(&self, request: Bytes) -> Result<ByteStream, TransportError> {
        if self.uploads.fetch_add(1, Ordering::SeqCst) == 0 {
            self.healthy.upload_pack(request).await
        } else {
            self.failing.upload_pack(request).await
        }
    }
}

#[tokio::test]
async fn test_stream_failure_during_blob_fetch() {
    let content = noise(4096);
    let build = |remote: MemoryRemote| {
        let root = remote.insert_files(&[("a.txt", &content[..])]);
        let commit = remote.commit(root, &[], TIMESTAMP);
        remote.set_ref("refs/heads/main", commit);
        Arc::new(remote)
    };
    let transport = FailsAfterPopulation {
        healthy: build(MemoryRemote::new(HashAlgorithm::Sha1).with_filter(true)),
        failing: build(
            MemoryRemote::new(HashAlgorithm::Sha1)
                .with_filter(true)
                .with_stream_failure(40, io::ErrorKind::ConnectionReset),
        ),
        uploads: AtomicUsize::new(0),
    };
    let tree = RemoteTree::open(transport, RemoteConfig::new("main")).await.unwrap();

    let err = tree.length("/a.txt").await.unwrap_err();
    assert!(err.is_transport_error());
    assert!(matches!(err, Error::Shared(_)));

    let mut reader = tree.read("/a.txt").await.unwrap().unwrap();
    let mut body = Vec::new();
    let err = reader.read_to_end(&mut body).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::Other);
}

// ==================== Cancellation ====================

#[tokio::test]
async fn test_cancel_fails_open_reader() {
    let remote = MemoryRemote::new(HashAlgorithm::Sha1);
    let content = noise(100 * 1024);
    let root = remote.insert_files(&[("a.txt", &content[..])]);
    let commit = remote.commit(root, &[], TIMESTAMP);
    remote.set_ref("refs/heads/main", commit);
    let tree = RemoteTree::open(Arc::new(remote), RemoteConfig::new("main"))
        .await
        .unwrap();

    let mut reader = tree.read("/a.txt").await.unwrap().unwrap();
    assert_eq!(reader.size(), content.len() as u64);
    let mut first = [0u8; 16];
    reader.read_exact(&mut first).await.unwrap();
    assert_eq!(&first[..], &content[..16]);

    tree.cancel();
    let mut rest = Vec::new();
    assert!(reader.read_to_end(&mut rest).await.is_err());
    assert!(rest.len() < content.len() - 16);
}

#[tokio::test]
async fn test_cancel_fails_blob_fetch() {
    let (remote, _) = sha1_remote();
    let tree = RemoteTree::open(remote, RemoteConfig::new("main")).await.unwrap();
    tree.cancel();

    let err = tree.read("/a.txt").await.err().unwrap();
    assert!(matches!(err.root(), Error::Cancelled));
}

// ==================== Watch ====================

#[tokio::test]
async fn test_watch_never_fires() {
    let (remote, _) = sha1_remote();
    let tree = RemoteTree::open(remote, RemoteConfig::new("main")).await.unwrap();
    let token = tree.watch("/a.txt");

    assert!(!token.has_changed());
    assert!(!token.active_change_callbacks());
    let waited = tokio::time::timeout(Duration::from_millis(20), token.changed()).await;
    assert!(waited.is_err());
}
