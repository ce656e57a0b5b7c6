//! Label <-> document id mapping
//!
//! The index speaks dense `u32` labels; callers speak document ids. Label `i`
//! is the `i`-th document ingested, so the map is just the ingestion-ordered
//! id list plus a reverse hash table.
//!
//! On disk the map is JSON `{"labels": [0, 1, ..], "ids": ["..", ..]}`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("Unknown label {label} (map has {len} entries)")]
    UnknownLabel { label: u32, len: usize },

    #[error("Unknown document id: {0}")]
    UnknownId(String),

    #[error("Duplicate document id: {0}")]
    DuplicateId(String),

    #[error("Labels must be exactly 0..{expected} in order (found {found} at position {position})")]
    InvalidLabels {
        expected: usize,
        position: usize,
        found: u32,
    },

    #[error("Length mismatch: {labels} labels, {ids} ids")]
    LengthMismatch { labels: usize, ids: usize },

    #[error("Invalid label map JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialized form of a [`LabelMap`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMapFile {
    pub labels: Vec<u32>,
    pub ids: Vec<String>,
}

/// Bijection between index labels and document ids. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    ids: Vec<String>,
    labels: HashMap<String, u32>,
}

impl PartialEq for LabelMap {
    fn eq(&self, other: &Self) -> bool {
        // The reverse table is derived from `ids`
        self.ids == other.ids
    }
}

impl Eq for LabelMap {}

impl LabelMap {
    /// Build from ids in ingestion order; label `i` maps to `ids[i]`.
    pub fn from_ids(ids: Vec<String>) -> Result<Self, LabelError> {
        if ids.len() > u32::MAX as usize {
            return Err(LabelError::LengthMismatch {
                labels: u32::MAX as usize,
                ids: ids.len(),
            });
        }
        let mut labels = HashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if labels.insert(id.clone(), i as u32).is_some() {
                return Err(LabelError::DuplicateId(id.clone()));
            }
        }
        Ok(Self { ids, labels })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Document id for a label
    #[inline]
    pub fn resolve(&self, label: u32) -> Result<&str, LabelError> {
        self.ids
            .get(label as usize)
            .map(String::as_str)
            .ok_or(LabelError::UnknownLabel {
                label,
                len: self.ids.len(),
            })
    }

    /// Label for a document id
    pub fn lookup(&self, id: &str) -> Result<u32, LabelError> {
        self.labels
            .get(id)
            .copied()
            .ok_or_else(|| LabelError::UnknownId(id.to_string()))
    }

    /// Ids in label order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn to_file(&self) -> LabelMapFile {
        LabelMapFile {
            labels: (0..self.ids.len() as u32).collect(),
            ids: self.ids.clone(),
        }
    }

    /// Validate a decoded file: equal lengths, labels exactly `0..N` in order,
    /// unique ids.
    pub fn from_file(file: LabelMapFile) -> Result<Self, LabelError> {
        if file.labels.len() != file.ids.len() {
            return Err(LabelError::LengthMismatch {
                labels: file.labels.len(),
                ids: file.ids.len(),
            });
        }
        if let Some((position, &found)) = file
            .labels
            .iter()
            .enumerate()
            .find(|(i, &label)| label as usize != *i)
        {
            return Err(LabelError::InvalidLabels {
                expected: file.ids.len(),
                position,
                found,
            });
        }
        Self::from_ids(file.ids)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, LabelError> {
        Ok(serde_json::to_vec(&self.to_file())?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, LabelError> {
        let file: LabelMapFile = serde_json::from_slice(bytes)?;
        Self::from_file(file)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LabelError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LabelError> {
        Self::from_json(&std::fs::read(path)?)
    }
}
