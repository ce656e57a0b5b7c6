//! postvec core: HNSW index, label map, and raw embeddings store
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            HNSW graph (owns prepared vectors)              │
//! │        insert · search · native .bin serialization         │
//! ├─────────────────────────────────────────────────────────────┤
//! │            LabelMap (label <-> document id)                │
//! ├─────────────────────────────────────────────────────────────┤
//! │        EmbeddingStore (.pvec raw vectors + ids)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod format;
pub mod hnsw;
pub mod labels;
pub mod simd;
pub mod store;

pub use format::{PvecHeader, PvecWriter, Quantization};
pub use hnsw::{HnswConfig, HnswError, Metric, Neighbor, HNSW};
pub use labels::{LabelError, LabelMap, LabelMapFile};
pub use simd::{dot_product, l2_distance};
pub use store::{EmbeddingStore, StoreError};
