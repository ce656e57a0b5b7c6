//! Blob storage collaborators
//!
//! Publishing and syncing only need an opaque put/get store keyed by
//! slash-separated paths. Three backends are provided: a local directory,
//! an HTTP object endpoint, and an in-memory map for tests.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

/// Opaque blob store keyed by path
pub trait BlobStore: Send + Sync {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError>;
}

/// `application/json` for `.json` paths, octet-stream otherwise
pub fn content_type_for(path: &str) -> &'static str {
    if path.ends_with(".json") {
        CONTENT_TYPE_JSON
    } else {
        CONTENT_TYPE_BINARY
    }
}

/// Open a store from a location string: `http(s)://...` for an object
/// endpoint, `memory:` for a process-local map, anything else is a directory.
pub fn open_store(location: &str, token: Option<String>) -> Result<Box<dyn BlobStore>, StorageError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Box::new(HttpBlobStore::new(location, token, Duration::from_secs(60))?))
    } else if location == "memory:" {
        Ok(Box::new(MemoryBlobStore::new()))
    } else {
        Ok(Box::new(FsBlobStore::new(location)?))
    }
}

fn check_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() || path.starts_with('/') || path.split('/').any(|p| p.is_empty() || p == "..") {
        return Err(StorageError::Unavailable(format!("invalid blob path {path:?}")));
    }
    Ok(())
}

/// Blobs as files under a root directory.
///
/// Writes go to a temp file that is synced and renamed into place, so a
/// reader never sees a half-written blob.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        check_path(path)?;
        Ok(self.root.join(path))
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let full = self.resolve(path)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<(), StorageError> {
        let dest = self.resolve(path)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(&dest);
        let written = write_synced(&tmp, bytes).and_then(|()| fs::rename(&tmp, &dest));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        sync_parent_dir(&dest)?;
        Ok(())
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sibling of `dest` no other writer in this or another process will pick:
/// `{file_name}.{pid}.{n}.tmp`
pub(crate) fn tmp_path(dest: &Path) -> PathBuf {
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.{}.tmp", std::process::id(), n));
    dest.with_file_name(name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

/// Object storage over plain HTTP: `GET {base}/{path}` and
/// `PUT {base}/{path}` with the blob as body.
pub struct HttpBlobStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpBlobStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, StorageError> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> Result<String, StorageError> {
        check_path(path)?;
        Ok(format!("{}/{}", self.base_url, path))
    }

    fn authorize(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

impl BlobStore for HttpBlobStore {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let url = self.url(path)?;
        let response = self.authorize(self.client.get(&url)).send()?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(path.to_string()));
        }
        let response = response.error_for_status()?;
        Ok(response.bytes()?.to_vec())
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        let url = self.url(path)?;
        tracing::debug!("PUT {} ({} bytes, {})", url, bytes.len(), content_type);
        self.authorize(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()?
            .error_for_status()?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-memory store. Records every put in order so callers can inspect
/// write sequencing.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, StoredBlob>>,
    writes: RwLock<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths in the order they were written
    pub fn write_log(&self) -> Vec<String> {
        self.writes.read().clone()
    }

    pub fn content_type(&self, path: &str) -> Option<String> {
        self.blobs.read().get(path).map(|b| b.content_type.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }

    pub fn remove(&self, path: &str) -> bool {
        self.blobs.write().remove(path).is_some()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .get(path)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        check_path(path)?;
        self.blobs.write().insert(
            path.to_string(),
            StoredBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        self.writes.write().push(path.to_string());
        Ok(())
    }
}

impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        (**self).get(path)
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        (**self).put(path, bytes, content_type)
    }
}

impl<T: BlobStore + ?Sized> BlobStore for Box<T> {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        (**self).get(path)
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<(), StorageError> {
        (**self).put(path, bytes, content_type)
    }
}
