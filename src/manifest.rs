//! Generation manifest and blob-store layout
//!
//! ```text
//! versions/{version}/index.bin
//! versions/{version}/index_mapping.json
//! versions/{version}/embeddings.pvec
//! versions/{version}/manifest.json
//! latest/manifest.json                  <- pointer, written last
//! ```
//!
//! Every artifact lives under a version-qualified path and is never
//! overwritten. Only the pointer is replaced, so a consumer that reads the
//! pointer always finds a complete, self-consistent generation behind it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use postvec_core::Quantization;

/// Path of the pointer to the newest published generation
pub const LATEST_MANIFEST: &str = "latest/manifest.json";

pub const INDEX_FILE: &str = "index.bin";
pub const MAPPING_FILE: &str = "index_mapping.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.pvec";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

/// Where each artifact of one generation lives in the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub index: String,
    pub index_mapping: String,
    pub embeddings: String,
    pub manifest: String,
}

impl ArtifactPaths {
    pub fn for_version(version: u64) -> Self {
        let dir = format!("versions/{version}");
        Self {
            index: format!("{dir}/{INDEX_FILE}"),
            index_mapping: format!("{dir}/{MAPPING_FILE}"),
            embeddings: format!("{dir}/{EMBEDDINGS_FILE}"),
            manifest: format!("{dir}/{MANIFEST_FILE}"),
        }
    }
}

/// SHA-256 hex digests of the artifact bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    pub index: String,
    pub index_mapping: String,
    pub embeddings: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub total_vectors: u64,
    pub dimensions: u32,
    pub model_id: String,
    #[serde(default)]
    pub quantization: Quantization,
    pub index_size_bytes: u64,
    pub embeddings_size_bytes: u64,
    pub artifact_paths: ArtifactPaths,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksums: Option<Checksums>,
}

impl Manifest {
    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse and structurally validate a manifest
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version == 0 {
            return Err(ManifestError::Invalid("version must be positive".into()));
        }
        if self.dimensions == 0 {
            return Err(ManifestError::Invalid("dimensions must be positive".into()));
        }
        let paths = &self.artifact_paths;
        for (name, path) in [
            ("index", &paths.index),
            ("index_mapping", &paths.index_mapping),
            ("embeddings", &paths.embeddings),
            ("manifest", &paths.manifest),
        ] {
            if path.is_empty() {
                return Err(ManifestError::Invalid(format!("artifact path '{name}' is empty")));
            }
            if path == LATEST_MANIFEST {
                return Err(ManifestError::Invalid(format!(
                    "artifact '{name}' points at the mutable latest pointer"
                )));
            }
        }
        if let Some(sums) = &self.checksums {
            for digest in [&sums.index, &sums.index_mapping, &sums.embeddings] {
                if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(ManifestError::Invalid(format!("malformed sha256 '{digest}'")));
                }
            }
        }
        Ok(())
    }
}

/// Next version number: the current unix time, bumped past `previous` so
/// versions strictly increase even within one second.
pub fn next_version(previous: Option<u64>, now_unix_secs: u64) -> u64 {
    match previous {
        Some(prev) => now_unix_secs.max(prev.saturating_add(1)),
        None => now_unix_secs.max(1),
    }
}

pub fn now_unix_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
