//! End-to-end reconciliation runs against an in-memory bucket.

use arcsync::state::{MetadataStore, DEFAULT_METADATA_KEY};
use arcsync::streaming::ByteStream;
use arcsync::transport::{BlobStore, ObjectStoreBackend, PutOptions};
use arcsync::{Reconciler, RunInput, RunOutput, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fixtures
// =============================================================================

const FILES: &[(&str, &str)] = &[
    ("a1.txt", "a1"),
    ("foo/b1.txt", "b1"),
    ("foo/b2.txt", "b2"),
    ("foo/bar/c1.txt", "c1"),
    ("baz/d1.txt", "d1"),
];

fn setup_tree(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("target");
    fs::create_dir_all(&root).unwrap();
    for (path, content) in files {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
    (tmp, root)
}

fn memory_backend() -> Arc<ObjectStoreBackend> {
    Arc::new(ObjectStoreBackend::new(Arc::new(InMemory::new())))
}

fn input(root: &Path, depth: usize) -> RunInput {
    let mut input = RunInput::new(root, "pref");
    input.max_depth = depth;
    input.storage_class = Some("STANDARD".to_string());
    input
}

async fn run(backend: Arc<dyn BlobStore>, input: RunInput) -> arcsync::Result<RunOutput> {
    Reconciler::new(input, backend)
        .run(CancellationToken::new())
        .await
}

async fn archive_keys(backend: &ObjectStoreBackend) -> Vec<String> {
    let mut keys = backend.list("pref").await.unwrap();
    keys.sort();
    keys
}

async fn seed_object(backend: &ObjectStoreBackend, key: &str) {
    backend
        .put(
            key,
            futures::StreamExt::boxed(futures::stream::once(async {
                Ok(Bytes::from_static(b"old"))
            })),
            &PutOptions::default(),
        )
        .await
        .unwrap();
}

async fn load_store(backend: &ObjectStoreBackend) -> MetadataStore {
    MetadataStore::load(backend, DEFAULT_METADATA_KEY)
        .await
        .unwrap()
}

async fn unpack(backend: &ObjectStoreBackend, key: &str) -> BTreeMap<String, String> {
    let bytes = backend.get(key).await.unwrap().unwrap();
    let raw = zstd::stream::decode_all(&bytes[..]).unwrap();
    let mut archive = tar::Archive::new(raw.as_slice());
    let mut files = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        files.insert(name, content);
    }
    files
}

// =============================================================================
// Test doubles
// =============================================================================

/// Delegates to an in-memory backend, failing puts whose key contains `fail_on`.
struct FailingBackend {
    inner: ObjectStoreBackend,
    fail_on: &'static str,
}

#[async_trait]
impl BlobStore for FailingBackend {
    async fn get(&self, key: &str) -> arcsync::Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: ByteStream, opts: &PutOptions) -> arcsync::Result<()> {
        if key.contains(self.fail_on) {
            return Err(SyncError::backend(
                "put",
                key,
                object_store::Error::Generic {
                    store: "test",
                    source: "injected failure".into(),
                },
            ));
        }
        self.inner.put(key, body, opts).await
    }

    async fn list(&self, prefix: &str) -> arcsync::Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete_batch(&self, keys: &[String]) -> arcsync::Result<()> {
        self.inner.delete_batch(keys).await
    }
}

/// Cancels the run and hangs when asked to store a key containing `hang_on`.
struct HangingBackend {
    inner: ObjectStoreBackend,
    hang_on: &'static str,
    cancel: CancellationToken,
}

#[async_trait]
impl BlobStore for HangingBackend {
    async fn get(&self, key: &str) -> arcsync::Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: ByteStream, opts: &PutOptions) -> arcsync::Result<()> {
        if key.contains(self.hang_on) {
            self.cancel.cancel();
            futures::future::pending::<()>().await;
        }
        self.inner.put(key, body, opts).await
    }

    async fn list(&self, prefix: &str) -> arcsync::Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete_batch(&self, keys: &[String]) -> arcsync::Result<()> {
        self.inner.delete_batch(keys).await
    }
}

// =============================================================================
// Reconciliation properties
// =============================================================================

#[tokio::test]
async fn test_cold_start_uploads_everything_and_creates_store() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();

    assert!(backend.get(DEFAULT_METADATA_KEY).await.unwrap().is_none());

    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 3, deleted: 0 });

    assert_eq!(
        archive_keys(&backend).await,
        vec![
            "pref/target/a1.txt.tar.zst",
            "pref/target/baz.tar.zst",
            "pref/target/foo.tar.zst",
        ]
    );
    let store = load_store(&backend).await;
    assert_eq!(store.len(), 3);
    assert!(store.get("pref/target/foo.tar.zst").is_some());
}

#[tokio::test]
async fn test_archives_hold_unit_relative_entries() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();
    run(backend.clone(), input(&root, 1)).await.unwrap();

    let foo = unpack(&backend, "pref/target/foo.tar.zst").await;
    assert_eq!(
        foo.into_iter().collect::<Vec<_>>(),
        vec![
            ("b1.txt".to_string(), "b1".to_string()),
            ("b2.txt".to_string(), "b2".to_string()),
            ("bar/c1.txt".to_string(), "c1".to_string()),
        ]
    );

    let a1 = unpack(&backend, "pref/target/a1.txt.tar.zst").await;
    assert_eq!(a1.get("a1.txt").map(String::as_str), Some("a1"));
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();

    run(backend.clone(), input(&root, 1)).await.unwrap();
    let keys_before = archive_keys(&backend).await;

    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 0, deleted: 0 });
    assert_eq!(archive_keys(&backend).await, keys_before);
}

#[tokio::test]
async fn test_size_not_content_triggers_upload() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();
    run(backend.clone(), input(&root, 1)).await.unwrap();

    // Same length, different bytes: invisible to the fingerprint
    fs::write(root.join("foo/b1.txt"), "XX").unwrap();
    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out.uploaded, 0);

    fs::write(root.join("foo/b1.txt"), "longer").unwrap();
    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 1, deleted: 0 });

    let foo = unpack(&backend, "pref/target/foo.tar.zst").await;
    assert_eq!(foo["b1.txt"], "longer");
}

#[tokio::test]
async fn test_removed_unit_deletes_exactly_its_archive() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();
    run(backend.clone(), input(&root, 1)).await.unwrap();

    fs::remove_file(root.join("a1.txt")).unwrap();
    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 0, deleted: 1 });

    assert_eq!(
        archive_keys(&backend).await,
        vec!["pref/target/baz.tar.zst", "pref/target/foo.tar.zst"]
    );
    let store = load_store(&backend).await;
    assert!(store.get("pref/target/a1.txt.tar.zst").is_none());
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_depth_two_units() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();

    let out = run(backend.clone(), input(&root, 2)).await.unwrap();
    assert_eq!(out.uploaded, 5);
    assert_eq!(
        archive_keys(&backend).await,
        vec![
            "pref/target/a1.txt.tar.zst",
            "pref/target/baz/d1.txt.tar.zst",
            "pref/target/foo/b1.txt.tar.zst",
            "pref/target/foo/b2.txt.tar.zst",
            "pref/target/foo/bar.tar.zst",
        ]
    );
}

#[tokio::test]
async fn test_depth_change_replaces_archives() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();

    let out = run(backend.clone(), input(&root, 0)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 1, deleted: 0 });
    assert_eq!(archive_keys(&backend).await, vec!["pref/target.tar.zst"]);

    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 3, deleted: 1 });
    assert!(!archive_keys(&backend)
        .await
        .contains(&"pref/target.tar.zst".to_string()));
}

#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();
    run(backend.clone(), input(&root, 1)).await.unwrap();

    fs::remove_file(root.join("a1.txt")).unwrap();
    fs::write(root.join("baz/new.txt"), "new").unwrap();

    let keys_before = archive_keys(&backend).await;
    let meta_before = backend.get(DEFAULT_METADATA_KEY).await.unwrap().unwrap();
    let baz_before = backend.get("pref/target/baz.tar.zst").await.unwrap().unwrap();

    let mut dry = input(&root, 1);
    dry.dry_run = true;
    let out = run(backend.clone(), dry).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 1, deleted: 1 });

    assert_eq!(archive_keys(&backend).await, keys_before);
    assert_eq!(
        backend.get(DEFAULT_METADATA_KEY).await.unwrap().unwrap(),
        meta_before
    );
    assert_eq!(
        backend.get("pref/target/baz.tar.zst").await.unwrap().unwrap(),
        baz_before
    );

    // The real run then does exactly what the dry run projected
    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 1, deleted: 1 });
}

#[tokio::test]
async fn test_dry_run_on_cold_bucket_creates_nothing() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();

    let mut dry = input(&root, 1);
    dry.dry_run = true;
    let out = run(backend.clone(), dry).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 3, deleted: 0 });
    assert!(backend.list("").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pool_size_does_not_change_final_store() {
    let files: Vec<(String, String)> = (0..24)
        .map(|i| (format!("dir{:02}/file.txt", i), "x".repeat(i + 1)))
        .collect();
    let refs: Vec<(&str, &str)> = files
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_str()))
        .collect();
    let (_tmp, root) = setup_tree(&refs);

    let serial = memory_backend();
    let mut one = input(&root, 1);
    one.concurrency = 1;
    let out = run(serial.clone(), one).await.unwrap();
    assert_eq!(out.uploaded, 24);

    let parallel = memory_backend();
    let mut many = input(&root, 1);
    many.concurrency = 8;
    let out = run(parallel.clone(), many).await.unwrap();
    assert_eq!(out.uploaded, 24);

    let serial_store = load_store(&serial).await;
    let parallel_store = load_store(&parallel).await;
    assert_eq!(serial_store.len(), 24);
    assert_eq!(serial_store, parallel_store);
}

#[tokio::test]
async fn test_prefixes_are_isolated() {
    let (_tmp_a, root_a) = setup_tree(&[("one.txt", "1")]);
    let (_tmp_b, root_b) = setup_tree(&[("two.txt", "2")]);
    let backend = memory_backend();

    // Both roots are named "target": separate prefixes keep them apart
    let mut a = input(&root_a, 1);
    a.prefix = "pref/a".to_string();
    let mut b = input(&root_b, 1);
    b.prefix = "pref/b".to_string();

    run(backend.clone(), a.clone()).await.unwrap();
    run(backend.clone(), b.clone()).await.unwrap();
    let out = run(backend.clone(), a).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 0, deleted: 0 });

    assert_eq!(
        archive_keys(&backend).await,
        vec!["pref/a/target/one.txt.tar.zst", "pref/b/target/two.txt.tar.zst"]
    );
    assert_eq!(load_store(&backend).await.len(), 2);
}

#[tokio::test]
async fn test_foreign_objects_under_prefix_are_reclaimed() {
    let (_tmp, root) = setup_tree(&[("one.txt", "1")]);
    let backend = memory_backend();
    for key in ["pref/junk.tar.zst", "pref/old-root/x.tar.zst", "pref/notes.txt"] {
        seed_object(&backend, key).await;
    }
    seed_object(&backend, "other/keep.tar.zst").await;

    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 1, deleted: 3 });
    assert_eq!(archive_keys(&backend).await, vec!["pref/target/one.txt.tar.zst"]);
    assert!(backend.get("other/keep.tar.zst").await.unwrap().is_some());
}

#[tokio::test]
async fn test_reserved_characters_in_root_and_unit_names() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("photos#2");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("notes~"), "n").unwrap();
    fs::write(root.join("b.txt"), "b").unwrap();
    let backend = memory_backend();

    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 2, deleted: 0 });
    assert_eq!(
        archive_keys(&backend).await,
        vec!["pref/photos%232/b.txt.tar.zst", "pref/photos%232/notes%7E.tar.zst"]
    );

    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 0, deleted: 0 });

    fs::remove_file(root.join("notes~")).unwrap();
    fs::remove_file(root.join("b.txt")).unwrap();
    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 0, deleted: 2 });
    assert!(archive_keys(&backend).await.is_empty());
    assert!(load_store(&backend).await.is_empty());

    // A unit that comes back unchanged is uploaded again
    fs::write(root.join("notes~"), "n").unwrap();
    let out = run(backend.clone(), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 1, deleted: 0 });
    assert_eq!(
        archive_keys(&backend).await,
        vec!["pref/photos%232/notes%7E.tar.zst"]
    );
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_failed_upload_aborts_without_recording() {
    let (_tmp, root) = setup_tree(FILES);
    let inner = ObjectStoreBackend::new(Arc::new(InMemory::new()));

    // Leave a stale archive behind: reclaim must not run after a failure
    seed_object(&inner, "pref/target/stale.tar.zst").await;

    let backend = Arc::new(FailingBackend {
        inner: inner.clone(),
        fail_on: "foo",
    });
    let mut single = input(&root, 1);
    single.concurrency = 1;
    let err = run(backend, single).await.unwrap_err();

    match &err {
        SyncError::Upload { unit, source } => {
            assert_eq!(unit, "foo");
            assert!(matches!(**source, SyncError::Backend { op: "put", .. }));
        }
        other => panic!("Expected Upload error, got {:?}", other),
    }

    assert!(inner
        .get("pref/target/stale.tar.zst")
        .await
        .unwrap()
        .is_some());

    // Units committed before the failure are persisted, the failed one is not
    let store = MetadataStore::load(&inner, DEFAULT_METADATA_KEY)
        .await
        .unwrap();
    assert!(store.get("pref/target/a1.txt.tar.zst").is_some());
    assert!(store.get("pref/target/baz.tar.zst").is_some());
    assert!(store.get("pref/target/foo.tar.zst").is_none());

    // A healthy re-run converges
    let out = run(Arc::new(inner.clone()), input(&root, 1)).await.unwrap();
    assert_eq!(out, RunOutput { uploaded: 1, deleted: 1 });
}

#[tokio::test]
async fn test_cancellation_still_persists_committed_units() {
    let (_tmp, root) = setup_tree(FILES);
    let inner = ObjectStoreBackend::new(Arc::new(InMemory::new()));
    let cancel = CancellationToken::new();

    let backend = Arc::new(HangingBackend {
        inner: inner.clone(),
        hang_on: "foo",
        cancel: cancel.clone(),
    });
    let mut single = input(&root, 1);
    single.concurrency = 1;

    let err = Reconciler::new(single, backend)
        .run(cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "got {:?}", err);

    let store = MetadataStore::load(&inner, DEFAULT_METADATA_KEY)
        .await
        .unwrap();
    assert!(store.get("pref/target/a1.txt.tar.zst").is_some());
    assert!(store.get("pref/target/baz.tar.zst").is_some());
    assert!(store.get("pref/target/foo.tar.zst").is_none());
}

#[tokio::test]
async fn test_corrupt_metadata_store_fails_run() {
    let (_tmp, root) = setup_tree(FILES);
    let backend = memory_backend();
    backend
        .put(
            DEFAULT_METADATA_KEY,
            futures::StreamExt::boxed(futures::stream::once(async {
                Ok(Bytes::from_static(b"\x07\x00\x00\x00 not a store"))
            })),
            &PutOptions::default(),
        )
        .await
        .unwrap();

    let err = run(backend.clone(), input(&root, 1)).await.unwrap_err();
    assert!(matches!(err, SyncError::MetadataDecode { .. }), "got {:?}", err);
    assert!(archive_keys(&backend).await.is_empty());
}

#[tokio::test]
async fn test_missing_root_is_traversal_error() {
    let tmp = TempDir::new().unwrap();
    let backend = memory_backend();
    let err = run(backend, input(&tmp.path().join("absent"), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Traversal { .. }), "got {:?}", err);
}
