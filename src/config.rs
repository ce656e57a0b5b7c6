//! Runtime configuration
//!
//! Defaults, overridden by environment variables, overridden again by CLI
//! flags in `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::builder::IndexParams;
use crate::embedder::{DEFAULT_DIMENSIONS, DEFAULT_MODEL_ID};
use crate::engine::EngineConfig;
use crate::manifest::{EMBEDDINGS_FILE, INDEX_FILE, MANIFEST_FILE, MAPPING_FILE};

pub const EVENTS_FILE: &str = "synthetic_events.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Local working directory for built artifacts
    pub output_dir: PathBuf,
    /// Embedding service base URL; the offline hash embedder is used when unset
    pub embedding_api_url: Option<String>,
    pub embedding_timeout: Duration,
    pub embedding_cache_size: usize,
    /// Blob store location: URL, `memory:`, or a directory
    pub store: Option<String>,
    pub store_token: Option<String>,
    pub model_id: String,
    pub dimensions: usize,
    pub index: IndexParams,
    pub engine: EngineConfig,
    pub sync_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            embedding_api_url: None,
            embedding_timeout: Duration::from_secs(30),
            embedding_cache_size: 100,
            store: None,
            store_token: None,
            model_id: DEFAULT_MODEL_ID.to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            index: IndexParams::default(),
            engine: EngineConfig::default(),
            sync_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("POSTVEC_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        config.embedding_api_url = get("EMBEDDING_API_URL");
        if let Some(secs) = get("EMBEDDING_TIMEOUT_SECS") {
            config.embedding_timeout = Duration::from_secs(parse("EMBEDDING_TIMEOUT_SECS", &secs)?);
        }
        config.store = get("POSTVEC_STORE");
        config.store_token = get("POSTVEC_STORE_TOKEN");
        if let Some(model) = get("POSTVEC_MODEL_ID") {
            config.model_id = model;
        }
        if let Some(dims) = get("POSTVEC_DIMENSIONS") {
            let dims: usize = parse("POSTVEC_DIMENSIONS", &dims)?;
            if dims == 0 {
                return Err(ConfigError::Invalid {
                    var: "POSTVEC_DIMENSIONS",
                    value: "0".into(),
                });
            }
            config.dimensions = dims;
        }
        if let Some(secs) = get("POSTVEC_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(parse("POSTVEC_SYNC_INTERVAL_SECS", &secs)?);
        }
        Ok(config)
    }

    pub fn events_path(&self) -> PathBuf {
        self.output_dir.join(EVENTS_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.output_dir.join(INDEX_FILE)
    }

    pub fn mapping_path(&self) -> PathBuf {
        self.output_dir.join(MAPPING_FILE)
    }

    pub fn embeddings_path(&self) -> PathBuf {
        self.output_dir.join(EMBEDDINGS_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE)
    }

    /// Where the sync command mirrors adopted generations
    pub fn mirror_dir(&self) -> PathBuf {
        self.output_dir.join("mirror")
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}
