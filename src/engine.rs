//! Query engine over the active index generation
//!
//! The active generation sits behind an `ArcSwapOption`. Each query takes
//! its own `Arc` snapshot, so a concurrent [`IndexQueryEngine::adopt`] never
//! changes the index or label map a running query sees, and readers never
//! take a lock.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use thiserror::Error;

use postvec_core::{HnswError, Metric};

use crate::builder::Generation;

pub const DEFAULT_EF_SEARCH: usize = 50;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Query dimension mismatch: index has {expected}, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("k must be at least 1")]
    InvalidK,

    #[error("Index returned label {label} with no document id (label map has {len})")]
    IndexMappingInconsistent { label: u32, len: usize },

    #[error("No index generation is loaded")]
    NoActiveGeneration,

    #[error("Index error: {0}")]
    Index(HnswError),
}

impl From<HnswError> for QueryError {
    fn from(err: HnswError) -> Self {
        match err {
            HnswError::DimensionMismatch { expected, actual } => {
                QueryError::DimensionMismatch { expected, actual }
            }
            other => QueryError::Index(other),
        }
    }
}

/// How raw similarity is reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreMode {
    /// `1 - distance` as computed (cosine can dip below 0)
    #[default]
    Raw,
    /// Clamped into `[0, 1]`
    Clamped,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ef_search: usize,
    pub score_mode: ScoreMode,
    /// Hits scoring below this are dropped after scoring
    pub min_score: Option<f32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ef_search: DEFAULT_EF_SEARCH,
            score_mode: ScoreMode::Raw,
            min_score: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

/// A generation together with the manifest version it was published as
#[derive(Debug)]
pub struct ActiveGeneration {
    pub version: u64,
    pub generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub version: Option<u64>,
    pub total_vectors: usize,
    pub dimensions: usize,
    pub metric: Option<String>,
    pub model_id: Option<String>,
    pub ef_search: usize,
}

pub struct IndexQueryEngine {
    active: ArcSwapOption<ActiveGeneration>,
    config: EngineConfig,
}

impl IndexQueryEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            active: ArcSwapOption::empty(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Make `generation` the one every subsequent query sees.
    ///
    /// Queries already running keep the generation they started with.
    pub fn adopt(&self, version: u64, generation: Generation) -> Arc<ActiveGeneration> {
        let next = Arc::new(ActiveGeneration { version, generation });
        let previous = self.active.swap(Some(next.clone()));
        tracing::info!(
            "Adopted index generation: version={} vectors={} previous={:?}",
            version,
            next.generation.len(),
            previous.map(|p| p.version)
        );
        next
    }

    /// Like [`IndexQueryEngine::adopt`], but only when `version` is above the
    /// one being served. The check and the swap are a single atomic step, so
    /// concurrent adopters can only move the engine forward.
    ///
    /// Returns `None` when refused.
    pub fn adopt_if_newer(&self, version: u64, generation: Generation) -> Option<Arc<ActiveGeneration>> {
        let next = Arc::new(ActiveGeneration { version, generation });
        let previous = self.active.rcu(|current| match current {
            Some(active) if active.version >= version => Some(Arc::clone(active)),
            _ => Some(Arc::clone(&next)),
        });

        let previous = previous.map(|p| p.version);
        if let Some(current) = previous.filter(|&v| v >= version) {
            tracing::info!(
                "Skipped index generation: version={} current={}",
                version,
                current
            );
            return None;
        }
        tracing::info!(
            "Adopted index generation: version={} vectors={} previous={:?}",
            version,
            next.generation.len(),
            previous
        );
        Some(next)
    }

    /// Drop the active generation; later queries fail with `NoActiveGeneration`
    pub fn unload(&self) {
        if let Some(previous) = self.active.swap(None) {
            tracing::info!("Unloaded index generation: version={}", previous.version);
        }
    }

    pub fn current(&self) -> Option<Arc<ActiveGeneration>> {
        self.active.load_full()
    }

    pub fn current_version(&self) -> Option<u64> {
        self.active.load().as_ref().map(|a| a.version)
    }

    /// Top `k` documents using the configured `ef_search`
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, QueryError> {
        self.search_with_ef(query, k, self.config.ef_search)
    }

    /// Top `k` documents, best first. `ef` below `k` is raised to `k`.
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<SearchHit>, QueryError> {
        if k == 0 {
            return Err(QueryError::InvalidK);
        }
        let active = self.active.load_full().ok_or(QueryError::NoActiveGeneration)?;
        let generation = &active.generation;
        let index = generation.index();
        if query.len() != index.dim() {
            return Err(QueryError::DimensionMismatch {
                expected: index.dim(),
                actual: query.len(),
            });
        }

        let neighbors = index.search(query, k, ef.max(k))?;
        let labels = generation.labels();
        let metric = index.metric();

        // Any unresolvable label fails the whole query
        let mut hits = Vec::with_capacity(neighbors.len());
        for n in neighbors {
            let id = labels
                .resolve(n.label)
                .map_err(|_| QueryError::IndexMappingInconsistent {
                    label: n.label,
                    len: labels.len(),
                })?;
            hits.push(SearchHit {
                id: id.to_string(),
                score: self.score(metric, n.distance),
            });
        }

        if let Some(min) = self.config.min_score {
            hits.retain(|h| h.score >= min);
        }
        Ok(hits)
    }

    fn score(&self, metric: Metric, distance: f32) -> f32 {
        let raw = metric.similarity(distance);
        match self.config.score_mode {
            ScoreMode::Raw => raw,
            ScoreMode::Clamped => raw.clamp(0.0, 1.0),
        }
    }

    pub fn stats(&self) -> EngineStats {
        match self.active.load_full() {
            Some(active) => EngineStats {
                version: Some(active.version),
                total_vectors: active.generation.len(),
                dimensions: active.generation.dim(),
                metric: Some(active.generation.index().metric().to_string()),
                model_id: Some(active.generation.model_id().to_string()),
                ef_search: self.config.ef_search,
            },
            None => EngineStats {
                version: None,
                total_vectors: 0,
                dimensions: 0,
                metric: None,
                model_id: None,
                ef_search: self.config.ef_search,
            },
        }
    }
}

impl Default for IndexQueryEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
