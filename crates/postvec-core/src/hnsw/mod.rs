//! HNSW (Hierarchical Navigable Small World) Index
//!
//! A multi-layer proximity graph for approximate nearest neighbor search.
//! One index is built per generation and never mutated afterwards; labels
//! are dense `u32` values assigned in insertion order.
//!
//! # Architecture
//!
//! ```text
//! Layer 2: o-------------------o            (few nodes, long-range)
//!          |                   |
//! Layer 1: o-------o-----------o-----o      (more nodes)
//!          |       |           |     |
//! Layer 0: o-o-o-o-o-o-o-o-o-o-o-o-o-o-o    (all nodes)
//! ```

mod index;
mod metric;
mod node;
mod serialize;
mod visited;

use thiserror::Error;

pub use index::{HnswConfig, HnswStats, Neighbor, HNSW};
pub use metric::Metric;
pub use node::Node;
pub use serialize::INDEX_MAGIC;

#[derive(Error, Debug)]
pub enum HnswError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index capacity exceeded: capacity is {capacity} elements")]
    CapacityExceeded { capacity: usize },

    #[error("Invalid index parameters: {0}")]
    InvalidParams(String),

    #[error("Corrupt index data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
