//! postvec: versioned vector index for community post search
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        documents ─▶ Embedder ─▶ IndexBuilder                │
//! │                  (HNSW + LabelMap + .pvec)                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ Publisher (children, then latest)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 BlobStore (fs / http / memory)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ SyncClient (all-or-nothing adopt)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           IndexQueryEngine (ArcSwap generations)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod builder;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod manifest;
pub mod publish;
pub mod storage;
pub mod sync;
pub mod synthetic;

pub use postvec_core::{format, hnsw, labels, simd, store};

pub use builder::{BuildError, DocumentRecord, Generation, IndexBuilder, IndexParams};
pub use engine::{EngineConfig, IndexQueryEngine, QueryError, ScoreMode, SearchHit};
pub use manifest::Manifest;
pub use postvec_core::{LabelMap, Metric, HNSW};
pub use publish::{PublishError, Publisher};
pub use sync::{SyncClient, SyncError, SyncState};
