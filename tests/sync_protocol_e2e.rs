use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use postvec::builder::{DocumentRecord, Generation, IndexBuilder, IndexParams};
use postvec::engine::{EngineConfig, IndexQueryEngine};
use postvec::manifest::{ArtifactPaths, Manifest, LATEST_MANIFEST};
use postvec::publish::{PublishError, Publisher};
use postvec::storage::{BlobStore, MemoryBlobStore, StorageError};
use postvec::sync::{SyncClient, SyncError, SyncState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

const DIM: usize = 8;

/// Ids carry the generation tag so any mixing shows up in query results
fn tagged_generation(tag: &str, n: usize, seed: u64) -> Generation {
    let mut rng = StdRng::seed_from_u64(seed);
    let docs: Vec<DocumentRecord> = (0..n)
        .map(|i| DocumentRecord {
            id: format!("{tag}-{i}"),
            vector: (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect(),
        })
        .collect();
    IndexBuilder::new(IndexParams {
        seed: Some(seed),
        ..IndexParams::default()
    })
    .build_generation(&docs, "test-model")
    .unwrap()
}

/// Wraps a store and fails reads or writes of paths containing a marker
#[derive(Clone)]
struct FaultyStore {
    inner: Arc<MemoryBlobStore>,
    fail_get: Arc<RwLock<Option<String>>>,
    fail_put: Arc<RwLock<Option<String>>>,
}

impl FaultyStore {
    fn new(inner: Arc<MemoryBlobStore>) -> Self {
        Self {
            inner,
            fail_get: Arc::new(RwLock::new(None)),
            fail_put: Arc::new(RwLock::new(None)),
        }
    }

    fn fail_gets_matching(&self, marker: Option<&str>) {
        *self.fail_get.write() = marker.map(str::to_string);
    }

    fn fail_puts_matching(&self, marker: Option<&str>) {
        *self.fail_put.write() = marker.map(str::to_string);
    }
}

impl BlobStore for FaultyStore {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        if let Some(marker) = self.fail_get.read().as_deref() {
            if path.contains(marker) {
                return Err(StorageError::Unavailable(format!("injected read failure: {path}")));
            }
        }
        self.inner.get(path)
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        if let Some(marker) = self.fail_put.read().as_deref() {
            if path.contains(marker) {
                return Err(StorageError::Unavailable(format!("injected write failure: {path}")));
            }
        }
        self.inner.put(path, bytes, content_type)
    }
}

/// Runs `hook` once, the first time `trigger` is read, before serving it
struct HookedStore<F> {
    inner: Arc<MemoryBlobStore>,
    trigger: String,
    hook: Mutex<Option<F>>,
}

impl<F: FnOnce() + Send> BlobStore for HookedStore<F> {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        if path == self.trigger {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        self.inner.get(path)
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.inner.put(path, bytes, content_type)
    }
}

fn publish_as(store: &Arc<MemoryBlobStore>, version: u64, generation: &Generation) {
    Publisher::new(store.clone())
        .publish_artifacts(
            version,
            generation.len(),
            generation.dim(),
            generation.model_id(),
            &generation.encode().unwrap(),
        )
        .unwrap();
}

fn engine() -> Arc<IndexQueryEngine> {
    Arc::new(IndexQueryEngine::new(EngineConfig::default()))
}

#[test]
fn v1_to_v2_never_mixes_generations() {
    let store = Arc::new(MemoryBlobStore::new());
    let publisher = Publisher::new(store.clone());
    let engine = engine();
    let client = SyncClient::new(store.clone(), engine.clone());

    assert_eq!(client.state(), SyncState::NoLocalVersion);
    assert_eq!(client.poll().unwrap(), SyncState::NoRemoteVersion);

    let v1 = publisher.publish(&tagged_generation("v1", 10, 1)).unwrap();
    assert_eq!(client.poll().unwrap(), SyncState::HaveVersion(v1.version));
    assert_eq!(engine.stats().total_vectors, 10);

    let stop = AtomicBool::new(false);
    thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut rng = StdRng::seed_from_u64(99);
            let mut seen = 0usize;
            while !stop.load(Ordering::Acquire) {
                let query: Vec<f32> = (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
                let hits = engine.search(&query, 12).unwrap();
                let tag = hits[0].id.split('-').next().unwrap().to_string();
                assert!(hits.iter().all(|h| h.id.starts_with(&format!("{tag}-"))), "mixed: {hits:?}");
                let expected = if tag == "v1" { 10 } else { 12 };
                assert_eq!(hits.len(), expected);
                seen += 1;
            }
            seen
        });

        let v2 = publisher.publish(&tagged_generation("v2", 12, 2)).unwrap();
        assert!(v2.version > v1.version);
        assert_eq!(client.poll().unwrap(), SyncState::HaveVersion(v2.version));
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Release);
        assert!(reader.join().unwrap() > 0);
    });

    let stats = engine.stats();
    assert_eq!(stats.version, Some(engine.current_version().unwrap()));
    assert_eq!(stats.total_vectors, 12);
}

#[test]
fn failed_artifact_fetch_keeps_serving_previous_generation() {
    let memory = Arc::new(MemoryBlobStore::new());
    let store = FaultyStore::new(memory.clone());
    let publisher = Publisher::new(memory.clone());
    let engine = engine();
    let client = SyncClient::new(store.clone(), engine.clone());

    let v1 = publisher.publish(&tagged_generation("v1", 10, 1)).unwrap();
    client.poll().unwrap();
    let v2 = publisher.publish(&tagged_generation("v2", 12, 2)).unwrap();

    store.fail_gets_matching(Some(&v2.artifact_paths.embeddings));
    let err = client.poll().unwrap_err();
    assert!(err.is_transient());
    assert_eq!(engine.current_version(), Some(v1.version));
    assert_eq!(engine.stats().total_vectors, 10);
    assert_eq!(
        client.state(),
        SyncState::StaleDetected {
            current: Some(v1.version),
            remote: v2.version,
        }
    );

    // Retried once the store recovers
    store.fail_gets_matching(None);
    assert_eq!(client.poll().unwrap(), SyncState::HaveVersion(v2.version));
    assert_eq!(engine.stats().total_vectors, 12);
}

#[test]
fn corrupted_artifact_is_rejected() {
    let store = Arc::new(MemoryBlobStore::new());
    let publisher = Publisher::new(store.clone());
    let engine = engine();
    let client = SyncClient::new(store.clone(), engine.clone());

    let v1 = publisher.publish(&tagged_generation("v1", 10, 1)).unwrap();
    client.poll().unwrap();
    let v2 = publisher.publish(&tagged_generation("v2", 12, 2)).unwrap();

    let mut index = store.get(&v2.artifact_paths.index).unwrap();
    let last = index.len() - 1;
    index[last] ^= 0xFF;
    store
        .put(&v2.artifact_paths.index, &index, "application/octet-stream")
        .unwrap();

    assert!(matches!(
        client.poll(),
        Err(SyncError::ArtifactIncomplete { version, .. }) if version == v2.version
    ));
    assert_eq!(engine.current_version(), Some(v1.version));
}

#[test]
fn lower_or_equal_remote_version_is_not_adopted() {
    let store = Arc::new(MemoryBlobStore::new());
    let publisher = Publisher::new(store.clone());
    let engine = engine();
    let client = SyncClient::new(store.clone(), engine.clone());

    let newer = tagged_generation("v100", 10, 1);
    publisher
        .publish_artifacts(100, newer.len(), newer.dim(), newer.model_id(), &newer.encode().unwrap())
        .unwrap();
    assert_eq!(client.poll().unwrap(), SyncState::HaveVersion(100));

    // Pointer moved backwards
    let older = tagged_generation("v50", 12, 2);
    publisher
        .publish_artifacts(50, older.len(), older.dim(), older.model_id(), &older.encode().unwrap())
        .unwrap();
    assert_eq!(client.poll().unwrap(), SyncState::HaveVersion(100));
    assert_eq!(engine.stats().total_vectors, 10);

    // Same version republished
    publisher
        .publish_artifacts(100, older.len(), older.dim(), older.model_id(), &older.encode().unwrap())
        .unwrap();
    assert_eq!(client.poll().unwrap(), SyncState::HaveVersion(100));
    let hits = engine.search(&[0.5; DIM], 3).unwrap();
    assert!(hits.iter().all(|h| h.id.starts_with("v100-")));
}

#[test]
fn slower_adopter_cannot_roll_back_a_newer_generation() {
    let newer_store = Arc::new(MemoryBlobStore::new());
    let older_store = Arc::new(MemoryBlobStore::new());
    publish_as(&newer_store, 300, &tagged_generation("v300", 12, 2));
    publish_as(&older_store, 200, &tagged_generation("v200", 10, 1));

    let engine = engine();
    let mirror = tempdir().unwrap();
    let fast = SyncClient::new(newer_store, engine.clone());

    // The fast client adopts 300 while the slow one is mid-fetch of 200
    let slow_store = HookedStore {
        inner: older_store,
        trigger: ArtifactPaths::for_version(200).manifest,
        hook: Mutex::new(Some(|| {
            assert_eq!(fast.poll().unwrap(), SyncState::HaveVersion(300));
        })),
    };
    let slow = SyncClient::new(slow_store, engine.clone())
        .with_mirror(mirror.path())
        .unwrap();

    assert_eq!(slow.poll().unwrap(), SyncState::HaveVersion(300));
    assert_eq!(engine.current_version(), Some(300));
    assert_eq!(engine.stats().total_vectors, 12);
    let hits = engine.search(&[0.5; DIM], 3).unwrap();
    assert!(hits.iter().all(|h| h.id.starts_with("v300-")));

    // Nothing was adopted, so nothing was mirrored
    assert!(!mirror.path().join("versions/200").exists());
    assert!(!mirror.path().join(LATEST_MANIFEST).exists());
    assert_eq!(slow.restore_local().unwrap(), None);
}

#[test]
fn racing_clients_leave_the_highest_version() {
    let stores: Vec<Arc<MemoryBlobStore>> = (1..=6u64)
        .map(|i| {
            let store = Arc::new(MemoryBlobStore::new());
            publish_as(&store, i * 100, &tagged_generation(&format!("v{}", i * 100), 8, i));
            store
        })
        .collect();

    let engine = engine();
    thread::scope(|scope| {
        for store in &stores {
            let client = SyncClient::new(store.clone(), engine.clone());
            scope.spawn(move || {
                assert!(matches!(client.poll().unwrap(), SyncState::HaveVersion(v) if v >= 100));
            });
        }
    });

    assert_eq!(engine.current_version(), Some(600));
    let hits = engine.search(&[0.5; DIM], 3).unwrap();
    assert!(hits.iter().all(|h| h.id.starts_with("v600-")));
}

#[test]
fn latest_pointer_is_written_last() {
    let store = Arc::new(MemoryBlobStore::new());
    let publisher = Publisher::new(store.clone());
    let manifest = publisher.publish(&tagged_generation("v1", 10, 1)).unwrap();

    let log = store.write_log();
    assert_eq!(log.len(), 5);
    assert_eq!(log.last().map(String::as_str), Some(LATEST_MANIFEST));
    assert_eq!(log[3], manifest.artifact_paths.manifest);

    let latest = Manifest::from_json(&store.get(LATEST_MANIFEST).unwrap()).unwrap();
    let versioned = Manifest::from_json(&store.get(&manifest.artifact_paths.manifest).unwrap()).unwrap();
    assert_eq!(latest, versioned);
    assert_eq!(latest.total_vectors, 10);
    assert_eq!(latest.dimensions, DIM as u32);
}

#[test]
fn failed_publish_leaves_latest_untouched() {
    let memory = Arc::new(MemoryBlobStore::new());
    let store = FaultyStore::new(memory.clone());
    let publisher = Publisher::new(store.clone());

    let v1 = publisher.publish(&tagged_generation("v1", 10, 1)).unwrap();
    let before = memory.get(LATEST_MANIFEST).unwrap();

    store.fail_puts_matching(Some("embeddings.pvec"));
    let err = publisher.publish(&tagged_generation("v2", 12, 2)).unwrap_err();
    assert!(matches!(err, PublishError::StorageUnavailable { .. }));
    assert_eq!(memory.get(LATEST_MANIFEST).unwrap(), before);

    // Consumers still see v1
    let engine = engine();
    let client = SyncClient::new(memory.clone(), engine.clone());
    assert_eq!(client.poll().unwrap(), SyncState::HaveVersion(v1.version));
}

#[test]
fn mirror_restores_last_adopted_generation_offline() {
    let store = Arc::new(MemoryBlobStore::new());
    let publisher = Publisher::new(store.clone());
    let mirror = tempdir().unwrap();

    let v1 = publisher.publish(&tagged_generation("v1", 10, 1)).unwrap();
    let first = SyncClient::new(store.clone(), engine())
        .with_mirror(mirror.path())
        .unwrap();
    first.poll().unwrap();

    // Fresh process, remote unreachable
    let offline = FaultyStore::new(Arc::new(MemoryBlobStore::new()));
    offline.fail_gets_matching(Some(""));
    let engine = engine();
    let second = SyncClient::new(offline, engine.clone())
        .with_mirror(mirror.path())
        .unwrap();

    assert_eq!(second.restore_local().unwrap(), Some(v1.version));
    assert_eq!(engine.stats().total_vectors, 10);
    assert!(second.poll().is_err());
    assert_eq!(engine.current_version(), Some(v1.version));
}

#[test]
fn run_loop_adopts_and_stops_on_shutdown() {
    let store = Arc::new(MemoryBlobStore::new());
    let publisher = Publisher::new(store.clone());
    let v1 = publisher.publish(&tagged_generation("v1", 10, 1)).unwrap();

    let engine = engine();
    let client = SyncClient::new(store.clone(), engine.clone());
    let (tx, rx) = crossbeam_channel::bounded(1);

    thread::scope(|scope| {
        let handle = scope.spawn(|| client.run(Duration::from_millis(10), rx));
        for _ in 0..200 {
            if engine.current_version().is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        tx.send(()).unwrap();
        handle.join().unwrap();
    });

    assert_eq!(engine.current_version(), Some(v1.version));
}
