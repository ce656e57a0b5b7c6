//! Consumer side of the manifest protocol
//!
//! ```text
//! NoLocalVersion ──fetch latest──▶ StaleDetected ──all 4 artifacts ok──▶ HaveVersion(v)
//!       │                               ▲   │
//!       └──no latest──▶ NoRemoteVersion │   └──any artifact fails──▶ StaleDetected (retry)
//!                                       │
//! HaveVersion(v) ──latest.version > v───┘
//! ```
//!
//! Adoption is all or nothing. The four artifacts are fetched, verified
//! against the manifest and decoded into a complete [`Generation`] before the
//! engine swaps to it. A version at or below the one being served is never
//! adopted.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use thiserror::Error;

use crate::builder::Generation;
use crate::engine::IndexQueryEngine;
use crate::manifest::{sha256_hex, Manifest, LATEST_MANIFEST};
use crate::storage::{content_type_for, BlobStore, FsBlobStore, StorageError};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Generation {version} incomplete: {reason}")]
    ArtifactIncomplete { version: u64, reason: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),
}

impl SyncError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::ArtifactIncomplete { .. } | SyncError::StorageUnavailable(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NoLocalVersion,
    NoRemoteVersion,
    HaveVersion(u64),
    StaleDetected { current: Option<u64>, remote: u64 },
}

struct Inner {
    state: SyncState,
    pending: Option<Manifest>,
}

/// Exponential retry delay: 1s, 2s, 4s, ... capped at 60s
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay to wait now; doubles the next one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

pub struct SyncClient<S> {
    store: S,
    engine: Arc<IndexQueryEngine>,
    mirror: Option<FsBlobStore>,
    inner: Mutex<Inner>,
}

impl<S: BlobStore> SyncClient<S> {
    pub fn new(store: S, engine: Arc<IndexQueryEngine>) -> Self {
        let state = match engine.current_version() {
            Some(v) => SyncState::HaveVersion(v),
            None => SyncState::NoLocalVersion,
        };
        Self {
            store,
            engine,
            mirror: None,
            inner: Mutex::new(Inner {
                state,
                pending: None,
            }),
        }
    }

    /// Also write every adopted generation under `dir` so a restart can
    /// serve it without the network (see [`SyncClient::restore_local`]).
    pub fn with_mirror<P: AsRef<Path>>(mut self, dir: P) -> Result<Self, SyncError> {
        let mirror = FsBlobStore::new(dir.as_ref()).map_err(|e| SyncError::StorageUnavailable(e.to_string()))?;
        self.mirror = Some(mirror);
        Ok(self)
    }

    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    pub fn engine(&self) -> &Arc<IndexQueryEngine> {
        &self.engine
    }

    /// Fetch the remote pointer and update the state without adopting.
    pub fn check(&self) -> Result<SyncState, SyncError> {
        let current = self.engine.current_version();
        let remote = match self.store.get(LATEST_MANIFEST) {
            Ok(bytes) => Some(
                Manifest::from_json(&bytes).map_err(|e| SyncError::ManifestInvalid(e.to_string()))?,
            ),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => return Err(SyncError::StorageUnavailable(e.to_string())),
        };

        let mut inner = self.inner.lock();
        inner.state = match (remote, current) {
            (None, None) => {
                inner.pending = None;
                SyncState::NoRemoteVersion
            }
            (None, Some(v)) => {
                tracing::warn!("Remote latest manifest missing; keeping version={}", v);
                inner.pending = None;
                SyncState::HaveVersion(v)
            }
            (Some(m), Some(v)) if m.version <= v => {
                inner.pending = None;
                SyncState::HaveVersion(v)
            }
            (Some(m), current) => {
                let remote = m.version;
                if inner.pending.as_ref().map(|p| p.version) != Some(remote) {
                    tracing::info!("Stale index detected: current={:?} remote={}", current, remote);
                }
                inner.pending = Some(m);
                SyncState::StaleDetected { current, remote }
            }
        };
        Ok(inner.state)
    }

    /// One sync round: check the pointer and, if a newer generation exists,
    /// try to adopt it. On failure the state stays `StaleDetected`.
    pub fn poll(&self) -> Result<SyncState, SyncError> {
        if !matches!(self.check()?, SyncState::StaleDetected { .. }) {
            return Ok(self.state());
        }
        let manifest = match self.inner.lock().pending.clone() {
            Some(m) => m,
            None => return Ok(self.state()),
        };

        let generation = fetch_generation(&self.store, &manifest)?;
        self.adopt(&manifest, generation)?;
        Ok(self.state())
    }

    /// Adopt the generation cached in the local mirror, if one exists and is
    /// newer than what is being served. Returns the adopted version.
    pub fn restore_local(&self) -> Result<Option<u64>, SyncError> {
        let Some(mirror) = &self.mirror else {
            return Ok(None);
        };
        let manifest = match mirror.get(LATEST_MANIFEST) {
            Ok(bytes) => Manifest::from_json(&bytes).map_err(|e| SyncError::ManifestInvalid(e.to_string()))?,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(SyncError::StorageUnavailable(e.to_string())),
        };
        if self.engine.current_version().is_some_and(|v| manifest.version <= v) {
            return Ok(None);
        }

        let generation = fetch_generation(mirror, &manifest)?;
        let version = manifest.version;
        let adopted = self.engine.adopt_if_newer(version, generation).is_some();
        self.settle(version);
        if !adopted {
            return Ok(None);
        }
        tracing::info!("Restored index from local mirror: version={}", version);
        Ok(Some(version))
    }

    /// Poll every `interval` until `shutdown` fires or disconnects. Transient
    /// failures retry with exponential backoff instead of the interval.
    pub fn run(&self, interval: Duration, shutdown: Receiver<()>) {
        let mut backoff = Backoff::default();
        loop {
            let delay = match self.poll() {
                Ok(state) => {
                    backoff.reset();
                    tracing::debug!("Sync poll: state={:?}", state);
                    interval
                }
                Err(err) if err.is_transient() => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Sync poll failed: error={} retry_in={:?}", err, delay);
                    delay
                }
                Err(err) => {
                    tracing::error!("Sync poll failed: error={}", err);
                    interval
                }
            };

            match shutdown.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::info!("Sync loop stopping");
                    return;
                }
            }
        }
    }

    fn adopt(&self, manifest: &Manifest, generation: Generation) -> Result<(), SyncError> {
        let version = manifest.version;
        // Refused when another adopter already moved the engine to this version or past it
        if let Some(active) = self.engine.adopt_if_newer(version, generation) {
            if let Some(mirror) = &self.mirror {
                if let Err(e) = write_mirror(mirror, manifest, &active.generation) {
                    tracing::warn!("Local mirror write failed: version={} error={}", version, e);
                }
            }
        }
        self.settle(version);
        Ok(())
    }

    /// Record the version the engine serves after an adoption attempt
    fn settle(&self, version: u64) {
        let current = self.engine.current_version().unwrap_or(version);
        let mut inner = self.inner.lock();
        inner.state = SyncState::HaveVersion(current);
        inner.pending = None;
    }
}

/// Fetch and verify every artifact named by `manifest`, returning the
/// decoded generation. Nothing is returned unless all four check out.
fn fetch_generation<B: BlobStore + ?Sized>(store: &B, manifest: &Manifest) -> Result<Generation, SyncError> {
    let version = manifest.version;
    let incomplete = |reason: String| {
        tracing::warn!("Artifact incomplete: version={} reason={}", version, reason);
        SyncError::ArtifactIncomplete { version, reason }
    };
    let fetch = |path: &str| {
        store
            .get(path)
            .map_err(|e| incomplete(format!("fetching {path}: {e}")))
    };

    let paths = &manifest.artifact_paths;
    let index = fetch(&paths.index)?;
    let mapping = fetch(&paths.index_mapping)?;
    let embeddings = fetch(&paths.embeddings)?;
    let versioned = fetch(&paths.manifest)?;

    let versioned = Manifest::from_json(&versioned)
        .map_err(|e| incomplete(format!("versioned manifest: {e}")))?;
    if versioned.version != version || versioned.artifact_paths != *paths {
        return Err(incomplete(format!(
            "versioned manifest describes version {} instead",
            versioned.version
        )));
    }

    if index.len() as u64 != manifest.index_size_bytes {
        return Err(incomplete(format!(
            "index is {} bytes, manifest says {}",
            index.len(),
            manifest.index_size_bytes
        )));
    }
    if embeddings.len() as u64 != manifest.embeddings_size_bytes {
        return Err(incomplete(format!(
            "embeddings are {} bytes, manifest says {}",
            embeddings.len(),
            manifest.embeddings_size_bytes
        )));
    }
    if let Some(sums) = &manifest.checksums {
        for (name, bytes, expected) in [
            ("index", &index, &sums.index),
            ("index_mapping", &mapping, &sums.index_mapping),
            ("embeddings", &embeddings, &sums.embeddings),
        ] {
            let actual = sha256_hex(bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(incomplete(format!(
                    "{name} checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }
    }

    let generation = Generation::from_artifacts(&index, &mapping, &embeddings)
        .map_err(|e| incomplete(e.to_string()))?;
    if generation.len() as u64 != manifest.total_vectors {
        return Err(incomplete(format!(
            "artifacts hold {} vectors, manifest says {}",
            generation.len(),
            manifest.total_vectors
        )));
    }
    if generation.dim() != manifest.dimensions as usize {
        return Err(incomplete(format!(
            "artifacts have dimension {}, manifest says {}",
            generation.dim(),
            manifest.dimensions
        )));
    }
    Ok(generation)
}

fn write_mirror(mirror: &FsBlobStore, manifest: &Manifest, generation: &Generation) -> Result<(), String> {
    // Never move the mirror's pointer backwards
    if let Ok(bytes) = mirror.get(LATEST_MANIFEST) {
        if let Ok(existing) = Manifest::from_json(&bytes) {
            if existing.version >= manifest.version {
                tracing::debug!(
                    "Local mirror already at version={}; skipping version={}",
                    existing.version,
                    manifest.version
                );
                return Ok(());
            }
        }
    }
    let artifacts = generation.encode().map_err(|e| e.to_string())?;
    let manifest_json = manifest.to_json().map_err(|e| e.to_string())?;
    let paths = &manifest.artifact_paths;
    for (path, bytes) in [
        (paths.index.as_str(), artifacts.index.as_slice()),
        (paths.index_mapping.as_str(), artifacts.index_mapping.as_slice()),
        (paths.embeddings.as_str(), artifacts.embeddings.as_slice()),
        (paths.manifest.as_str(), manifest_json.as_slice()),
        (LATEST_MANIFEST, manifest_json.as_slice()),
    ] {
        mirror
            .put(path, bytes, content_type_for(path))
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}
