//! Index construction
//!
//! Turns `(document id, vector)` pairs into one immutable [`Generation`]:
//! the HNSW graph, the label map, and the raw embeddings store. Labels are
//! assigned in input order, so `labels.resolve(i)` is the id of the `i`-th
//! document.

use std::path::Path;

use rayon::prelude::*;
use thiserror::Error;

use postvec_core::format::{self, FormatError};
use postvec_core::{EmbeddingStore, HnswConfig, HnswError, LabelError, LabelMap, Metric, StoreError, HNSW};

use crate::embedder::{EmbedError, Embedder};
use crate::manifest::{EMBEDDINGS_FILE, INDEX_FILE, MAPPING_FILE};

/// Elements the index reserves room for, beyond which inserts fail
const MIN_CAPACITY: usize = 1000;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Cannot build an index from zero documents")]
    EmptyInput,

    #[error("Dimension mismatch for document {id}: expected {expected}, got {actual}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Duplicate document id: {0}")]
    DuplicateId(String),

    #[error("Index construction failed: {0}")]
    Graph(#[from] HnswError),

    #[error("Embeddings store encoding failed: {0}")]
    Store(#[from] FormatError),
}

/// Artifacts that do not agree with each other or fail to decode
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Index artifact: {0}")]
    Index(#[from] HnswError),

    #[error("Label mapping artifact: {0}")]
    Labels(#[from] LabelError),

    #[error("Embeddings artifact: {0}")]
    Embeddings(#[from] StoreError),

    #[error("Inconsistent generation: {0}")]
    Inconsistent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDocument {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct IndexParams {
    pub m: usize,
    pub ef_construction: usize,
    pub metric: Metric,
    /// Fixed level-assignment seed; random when `None`
    pub seed: Option<u64>,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            metric: Metric::Cosine,
            seed: None,
        }
    }
}

pub struct IndexBuilder {
    params: IndexParams,
}

impl IndexBuilder {
    pub fn new(params: IndexParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &IndexParams {
        &self.params
    }

    /// Build the graph and label map.
    ///
    /// All documents are validated before the first insert: an empty input,
    /// a vector whose length differs from the first document's, or a repeated
    /// id aborts the build with nothing produced.
    pub fn build(&self, documents: &[DocumentRecord]) -> Result<(HNSW, LabelMap), BuildError> {
        let first = documents.first().ok_or(BuildError::EmptyInput)?;
        let dim = first.vector.len();
        if dim == 0 {
            return Err(BuildError::DimensionMismatch {
                id: first.id.clone(),
                expected: 1,
                actual: 0,
            });
        }
        if let Some(bad) = documents.iter().find(|d| d.vector.len() != dim) {
            return Err(BuildError::DimensionMismatch {
                id: bad.id.clone(),
                expected: dim,
                actual: bad.vector.len(),
            });
        }

        let labels = LabelMap::from_ids(documents.iter().map(|d| d.id.clone()).collect())
            .map_err(|e| match e {
                LabelError::DuplicateId(id) => BuildError::DuplicateId(id),
                other => BuildError::Graph(HnswError::InvalidParams(other.to_string())),
            })?;

        let total = documents.len();
        let mut index = HNSW::new(
            dim,
            HnswConfig {
                m: self.params.m,
                ef_construction: self.params.ef_construction,
                metric: self.params.metric,
                capacity: (total * 2).max(MIN_CAPACITY),
                seed: self.params.seed,
            },
        )?;

        tracing::info!(
            "Building index: vectors={} dim={} m={} ef_construction={} metric={}",
            total,
            dim,
            self.params.m,
            self.params.ef_construction,
            self.params.metric
        );
        let step = (total / 10).max(1);
        for (i, doc) in documents.iter().enumerate() {
            let label = index.insert(&doc.vector)?;
            debug_assert_eq!(label as usize, i);
            if (i + 1) % step == 0 && total >= 1000 {
                tracing::info!(
                    "Building index: {:.0}% ({}/{})",
                    (i + 1) as f64 * 100.0 / total as f64,
                    i + 1,
                    total
                );
            }
        }

        Ok((index, labels))
    }

    /// Build a full generation, keeping the raw vectors alongside the graph
    pub fn build_generation(
        &self,
        documents: &[DocumentRecord],
        model_id: &str,
    ) -> Result<Generation, BuildError> {
        let (index, labels) = self.build(documents)?;
        let bytes = format::encode(
            index.dim(),
            model_id,
            documents.iter().map(|d| (d.id.as_str(), d.vector.as_slice())),
        )?;
        let embeddings = EmbeddingStore::from_bytes(&bytes).map_err(|e| match e {
            StoreError::Format(f) => BuildError::Store(f),
            other => BuildError::Store(FormatError::Invalid(other.to_string())),
        })?;
        Ok(Generation {
            index,
            labels,
            embeddings,
        })
    }
}

/// A document the embedding batch left out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDocument {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct EmbedReport {
    pub embedded: usize,
    pub skipped: Vec<SkippedDocument>,
}

/// Embed every document, in parallel, preserving input order.
///
/// A failed call skips that document and the batch continues. So does a
/// vector whose length differs from `expected_dim` (or, when `None`, from the
/// first successful vector) so labels and vectors can never drift apart.
pub fn embed_documents<E: Embedder + ?Sized>(
    embedder: &E,
    documents: &[TextDocument],
    expected_dim: Option<usize>,
) -> (Vec<DocumentRecord>, EmbedReport) {
    let results: Vec<Result<Vec<f32>, EmbedError>> = documents
        .par_iter()
        .map(|doc| embedder.embed(&doc.text))
        .collect();

    let mut dim = expected_dim;
    let mut records = Vec::with_capacity(documents.len());
    let mut report = EmbedReport::default();

    for (doc, result) in documents.iter().zip(results) {
        let reason = match result {
            Ok(vector) => {
                let expected = *dim.get_or_insert(vector.len());
                if vector.len() == expected {
                    records.push(DocumentRecord {
                        id: doc.id.clone(),
                        vector,
                    });
                    continue;
                }
                format!("dimension {} != expected {}", vector.len(), expected)
            }
            Err(err) => err.to_string(),
        };
        tracing::warn!("Skipping document id={} reason={}", doc.id, reason);
        report.skipped.push(SkippedDocument {
            id: doc.id.clone(),
            reason,
        });
    }

    report.embedded = records.len();
    tracing::info!(
        "Embedded documents: embedded={} skipped={}",
        report.embedded,
        report.skipped.len()
    );
    (records, report)
}

/// Encoded artifact blobs of one generation
#[derive(Debug, Clone)]
pub struct GenerationArtifacts {
    pub index: Vec<u8>,
    pub index_mapping: Vec<u8>,
    pub embeddings: Vec<u8>,
}

/// One immutable, self-consistent index generation
pub struct Generation {
    index: HNSW,
    labels: LabelMap,
    embeddings: EmbeddingStore,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("vectors", &self.labels.len())
            .field("dim", &self.index.dim())
            .field("metric", &self.index.metric())
            .field("model_id", &self.embeddings.model_id())
            .finish()
    }
}

impl Generation {
    /// Assemble a generation, checking the three parts describe the same
    /// documents.
    pub fn new(index: HNSW, labels: LabelMap, embeddings: EmbeddingStore) -> Result<Self, ArtifactError> {
        if index.len() != labels.len() {
            return Err(ArtifactError::Inconsistent(format!(
                "index holds {} vectors, label map {}",
                index.len(),
                labels.len()
            )));
        }
        if embeddings.len() != labels.len() {
            return Err(ArtifactError::Inconsistent(format!(
                "embeddings store holds {} rows, label map {}",
                embeddings.len(),
                labels.len()
            )));
        }
        if embeddings.dim() != index.dim() {
            return Err(ArtifactError::Inconsistent(format!(
                "embeddings dimension {} != index dimension {}",
                embeddings.dim(),
                index.dim()
            )));
        }
        if embeddings.ids() != labels.ids() {
            return Err(ArtifactError::Inconsistent(
                "embeddings ids disagree with label map".into(),
            ));
        }
        Ok(Self {
            index,
            labels,
            embeddings,
        })
    }

    /// Assemble without the cross-checks in [`Generation::new`]
    #[cfg(test)]
    pub(crate) fn unchecked(index: HNSW, labels: LabelMap, embeddings: EmbeddingStore) -> Self {
        Self {
            index,
            labels,
            embeddings,
        }
    }

    /// Decode and cross-check downloaded artifacts
    pub fn from_artifacts(index: &[u8], index_mapping: &[u8], embeddings: &[u8]) -> Result<Self, ArtifactError> {
        let index = HNSW::from_bytes(index)?;
        let labels = LabelMap::from_json(index_mapping)?;
        let embeddings = EmbeddingStore::from_bytes(embeddings)?;
        Self::new(index, labels, embeddings)
    }

    pub fn encode(&self) -> Result<GenerationArtifacts, ArtifactError> {
        let rows = self
            .embeddings
            .iter()
            .collect::<Result<Vec<_>, StoreError>>()?;
        let embeddings = format::encode(self.embeddings.dim(), self.embeddings.model_id(), rows)
            .map_err(StoreError::from)?;
        Ok(GenerationArtifacts {
            index: self.index.to_bytes(),
            index_mapping: self.labels.to_json()?,
            embeddings,
        })
    }

    /// Write the three artifacts into `dir` under their standard file names.
    /// Each file is written beside its target and renamed over it, so a
    /// mapped store from an earlier generation never sees its file change.
    pub fn write_to_dir(&self, dir: &Path) -> Result<GenerationArtifacts, ArtifactError> {
        std::fs::create_dir_all(dir)?;
        let artifacts = self.encode()?;
        for (name, bytes) in [
            (INDEX_FILE, &artifacts.index),
            (MAPPING_FILE, &artifacts.index_mapping),
            (EMBEDDINGS_FILE, &artifacts.embeddings),
        ] {
            let tmp = crate::storage::tmp_path(&dir.join(name));
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, dir.join(name))?;
        }
        Ok(artifacts)
    }

    /// Load a generation written by [`Generation::write_to_dir`]. The
    /// embeddings store is memory-mapped.
    pub fn read_from_dir(dir: &Path) -> Result<Self, ArtifactError> {
        let index = HNSW::load(dir.join(INDEX_FILE))?;
        let labels = LabelMap::load(dir.join(MAPPING_FILE))?;
        let embeddings = EmbeddingStore::open(dir.join(EMBEDDINGS_FILE))?;
        Self::new(index, labels, embeddings)
    }

    pub fn index(&self) -> &HNSW {
        &self.index
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    pub fn embeddings(&self) -> &EmbeddingStore {
        &self.embeddings
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.index.dim()
    }

    pub fn model_id(&self) -> &str {
        self.embeddings.model_id()
    }

    /// Raw vectors back as documents, for re-indexing without re-embedding
    pub fn documents(&self) -> Result<Vec<DocumentRecord>, StoreError> {
        self.embeddings
            .iter()
            .map(|row| {
                row.map(|(id, vector)| DocumentRecord {
                    id: id.to_string(),
                    vector: vector.to_vec(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, vector: &[f32]) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            vector: vector.to_vec(),
        }
    }

    fn seeded() -> IndexBuilder {
        IndexBuilder::new(IndexParams {
            seed: Some(7),
            ..IndexParams::default()
        })
    }

    #[test]
    fn test_labels_follow_input_order() {
        let docs = vec![doc("a", &[1.0, 0.0]), doc("b", &[0.0, 1.0]), doc("c", &[0.9, 0.1])];
        let (index, labels) = seeded().build(&docs).unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(index.capacity(), 1000);
        for (i, d) in docs.iter().enumerate() {
            assert_eq!(labels.resolve(i as u32).unwrap(), d.id);
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(seeded().build(&[]), Err(BuildError::EmptyInput)));
    }

    #[test]
    fn test_dimension_mismatch_aborts() {
        let docs = vec![doc("a", &[1.0, 0.0]), doc("b", &[0.0, 1.0, 0.0])];
        let err = seeded().build(&docs).unwrap_err();
        assert!(matches!(
            err,
            BuildError::DimensionMismatch { ref id, expected: 2, actual: 3 } if id == "b"
        ));
    }

    #[test]
    fn test_duplicate_id() {
        let docs = vec![doc("a", &[1.0, 0.0]), doc("a", &[0.0, 1.0])];
        assert!(matches!(seeded().build(&docs), Err(BuildError::DuplicateId(id)) if id == "a"));
    }

    #[test]
    fn test_input_is_not_mutated() {
        let docs = vec![doc("a", &[3.0, 4.0]), doc("b", &[0.0, 2.0])];
        let before = docs.clone();
        seeded().build(&docs).unwrap();
        assert_eq!(docs, before);
    }

    #[test]
    fn test_generation_artifacts_roundtrip() {
        let docs: Vec<DocumentRecord> = (0..40)
            .map(|i| doc(&format!("n{i}"), &[(i as f32).sin(), (i as f32).cos(), 0.5]))
            .collect();
        let generation = seeded().build_generation(&docs, "m1").unwrap();
        let artifacts = generation.encode().unwrap();

        let decoded = Generation::from_artifacts(
            &artifacts.index,
            &artifacts.index_mapping,
            &artifacts.embeddings,
        )
        .unwrap();
        assert_eq!(decoded.len(), 40);
        assert_eq!(decoded.model_id(), "m1");
        assert_eq!(decoded.documents().unwrap(), docs);
    }

    #[test]
    fn test_dir_roundtrip_uses_mapped_store() {
        let dir = tempfile::tempdir().unwrap();
        let docs = vec![doc("a", &[1.0, 0.0]), doc("b", &[0.0, 1.0])];
        seeded()
            .build_generation(&docs, "m")
            .unwrap()
            .write_to_dir(dir.path())
            .unwrap();

        let loaded = Generation::read_from_dir(dir.path()).unwrap();
        assert_eq!(loaded.labels().ids(), &["a", "b"]);
        assert_eq!(loaded.embeddings().try_get(1).unwrap(), &[0.0, 1.0]);
    }

    #[test]
    fn test_mismatched_artifacts_rejected() {
        let small = seeded()
            .build_generation(&[doc("a", &[1.0, 0.0])], "m")
            .unwrap()
            .encode()
            .unwrap();
        let large = seeded()
            .build_generation(&[doc("a", &[1.0, 0.0]), doc("b", &[0.0, 1.0])], "m")
            .unwrap()
            .encode()
            .unwrap();

        let err = Generation::from_artifacts(&large.index, &small.index_mapping, &small.embeddings)
            .unwrap_err();
        assert!(matches!(err, ArtifactError::Inconsistent(_)));
    }

    struct FlakyEmbedder;

    impl Embedder for FlakyEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            match text {
                "down" => Err(EmbedError::Unavailable("timeout".into())),
                "short" => Ok(vec![1.0]),
                _ => Ok(vec![text.len() as f32, 1.0]),
            }
        }

        fn model_id(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn test_embed_documents_skips_failures_in_order() {
        let docs: Vec<TextDocument> = ["one", "down", "three", "short", "fifth"]
            .iter()
            .enumerate()
            .map(|(i, t)| TextDocument {
                id: format!("d{i}"),
                text: t.to_string(),
            })
            .collect();

        let (records, report) = embed_documents(&FlakyEmbedder, &docs, None);
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d0", "d2", "d4"]);
        assert_eq!(report.embedded, 3);
        let skipped: Vec<&str> = report.skipped.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(skipped, vec!["d1", "d3"]);
    }
}
