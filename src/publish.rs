//! Publishing a generation to the blob store
//!
//! Order matters: index, mapping, embeddings, the version-qualified manifest,
//! and only then `latest/manifest.json`. A failure at any step aborts before
//! the pointer moves, so consumers keep seeing the previous generation.

use chrono::Utc;
use thiserror::Error;

use postvec_core::Quantization;

use crate::builder::{ArtifactError, Generation, GenerationArtifacts};
use crate::manifest::{
    next_version, now_unix_secs, sha256_hex, ArtifactPaths, Checksums, Manifest, ManifestError,
    LATEST_MANIFEST,
};
use crate::storage::{content_type_for, BlobStore, StorageError};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Storage unavailable while writing {path}: {source}")]
    StorageUnavailable {
        path: String,
        #[source]
        source: StorageError,
    },

    #[error("Failed to encode artifacts: {0}")]
    Encode(String),
}

impl From<ArtifactError> for PublishError {
    fn from(err: ArtifactError) -> Self {
        PublishError::Encode(err.to_string())
    }
}

impl From<ManifestError> for PublishError {
    fn from(err: ManifestError) -> Self {
        PublishError::Encode(err.to_string())
    }
}

pub struct Publisher<S> {
    store: S,
}

impl<S: BlobStore> Publisher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Version currently behind the `latest` pointer, if any
    pub fn latest_version(&self) -> Result<Option<u64>, PublishError> {
        match self.store.get(LATEST_MANIFEST) {
            Ok(bytes) => Ok(Some(Manifest::from_json(&bytes)?.version)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(source) => Err(PublishError::StorageUnavailable {
                path: LATEST_MANIFEST.to_string(),
                source,
            }),
        }
    }

    /// Encode and publish `generation` under a fresh version number.
    pub fn publish(&self, generation: &Generation) -> Result<Manifest, PublishError> {
        let artifacts = generation.encode()?;
        let version = next_version(self.latest_version()?, now_unix_secs());
        self.publish_artifacts(
            version,
            generation.len(),
            generation.dim(),
            generation.model_id(),
            &artifacts,
        )
    }

    /// Publish pre-encoded artifacts as `version`.
    pub fn publish_artifacts(
        &self,
        version: u64,
        total_vectors: usize,
        dimensions: usize,
        model_id: &str,
        artifacts: &GenerationArtifacts,
    ) -> Result<Manifest, PublishError> {
        let manifest = describe(version, total_vectors, dimensions, model_id, artifacts)?;
        let paths = &manifest.artifact_paths;
        let manifest_json = manifest.to_json()?;

        self.put(&paths.index, &artifacts.index)?;
        self.put(&paths.index_mapping, &artifacts.index_mapping)?;
        self.put(&paths.embeddings, &artifacts.embeddings)?;
        self.put(&paths.manifest, &manifest_json)?;
        self.put(LATEST_MANIFEST, &manifest_json)?;

        tracing::info!(
            "Published generation: version={} vectors={} dimensions={} index_bytes={}",
            version,
            total_vectors,
            dimensions,
            artifacts.index.len()
        );
        Ok(manifest)
    }

    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), PublishError> {
        self.store
            .put(path, bytes, content_type_for(path))
            .map_err(|source| {
                tracing::error!("Publish aborted: path={} error={}", path, source);
                PublishError::StorageUnavailable {
                    path: path.to_string(),
                    source,
                }
            })
    }
}

/// Manifest describing `artifacts` as generation `version`, checksums included
pub fn describe(
    version: u64,
    total_vectors: usize,
    dimensions: usize,
    model_id: &str,
    artifacts: &GenerationArtifacts,
) -> Result<Manifest, PublishError> {
    Ok(Manifest {
        version,
        updated_at: Utc::now(),
        total_vectors: total_vectors as u64,
        dimensions: u32::try_from(dimensions)
            .map_err(|_| PublishError::Encode(format!("dimensions {dimensions} exceed u32")))?,
        model_id: model_id.to_string(),
        quantization: Quantization::Float32,
        index_size_bytes: artifacts.index.len() as u64,
        embeddings_size_bytes: artifacts.embeddings.len() as u64,
        artifact_paths: ArtifactPaths::for_version(version),
        checksums: Some(Checksums {
            index: sha256_hex(&artifacts.index),
            index_mapping: sha256_hex(&artifacts.index_mapping),
            embeddings: sha256_hex(&artifacts.embeddings),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{DocumentRecord, IndexBuilder, IndexParams};
    use crate::storage::{MemoryBlobStore, CONTENT_TYPE_BINARY, CONTENT_TYPE_JSON};

    fn generation() -> Generation {
        let docs = vec![
            DocumentRecord {
                id: "a".into(),
                vector: vec![1.0, 0.0],
            },
            DocumentRecord {
                id: "b".into(),
                vector: vec![0.0, 1.0],
            },
        ];
        IndexBuilder::new(IndexParams::default())
            .build_generation(&docs, "m")
            .unwrap()
    }

    #[test]
    fn test_latest_is_written_last() {
        let publisher = Publisher::new(MemoryBlobStore::new());
        let manifest = publisher.publish(&generation()).unwrap();

        let log = publisher.store().write_log();
        assert_eq!(log.len(), 5);
        assert_eq!(log.last().map(String::as_str), Some(LATEST_MANIFEST));
        assert_eq!(log[3], manifest.artifact_paths.manifest);

        let store = publisher.store();
        assert_eq!(store.content_type(LATEST_MANIFEST).as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(
            store.content_type(&manifest.artifact_paths.index).as_deref(),
            Some(CONTENT_TYPE_BINARY)
        );
    }

    #[test]
    fn test_manifest_describes_artifacts() {
        let publisher = Publisher::new(MemoryBlobStore::new());
        let manifest = publisher.publish(&generation()).unwrap();
        let store = publisher.store();

        let index = store.get(&manifest.artifact_paths.index).unwrap();
        assert_eq!(manifest.index_size_bytes, index.len() as u64);
        assert_eq!(manifest.total_vectors, 2);
        assert_eq!(manifest.dimensions, 2);
        assert_eq!(manifest.checksums.as_ref().unwrap().index, sha256_hex(&index));

        let latest = Manifest::from_json(&store.get(LATEST_MANIFEST).unwrap()).unwrap();
        assert_eq!(latest, manifest);
    }

    #[test]
    fn test_versions_strictly_increase() {
        let publisher = Publisher::new(MemoryBlobStore::new());
        let first = publisher.publish(&generation()).unwrap();
        let second = publisher.publish(&generation()).unwrap();
        assert!(second.version > first.version);
        assert_eq!(publisher.latest_version().unwrap(), Some(second.version));
    }
}
