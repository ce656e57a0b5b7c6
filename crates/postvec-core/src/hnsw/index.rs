//! HNSW Index Implementation
//!
//! - Random layer assignment (exponential distribution)
//! - Diversity-preserving neighbor selection heuristic
//! - Greedy beam search with epoch-based visited tracking
//!
//! # Algorithm Overview
//!
//! **Insert**: Assign random layer L, search top-down from entry point to L,
//! then wire connections on all layers from L down to 0.
//!
//! **Search**: Start at entry point, greedy descent to layer 0, then beam search
//! on layer 0 with ef candidates.
//!
//! The index owns a flat copy of every vector so a serialized index is
//! self-contained and can be queried without the raw embeddings store.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::metric::Metric;
use super::node::Node;
use super::visited::VisitedGuard;
use super::HnswError;

/// Hard cap on assigned layers; keeps the on-disk layer count in a `u8`.
pub(crate) const MAX_LAYER: usize = 32;

/// Entry on the exploration frontier (min-heap by distance)
#[derive(Clone, Copy)]
struct Candidate {
    label: u32,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the closest first
        other.distance.total_cmp(&self.distance)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Search hit: a label and its distance to the query (smaller is closer)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub label: u32,
    pub distance: f32,
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on distance keeps the current worst result on top
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.label.cmp(&other.label))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Construction parameters
#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Max neighbors per upper layer (layer 0 keeps `2 * m`)
    pub m: usize,
    /// Candidate list size while inserting
    pub ef_construction: usize,
    pub metric: Metric,
    /// Maximum number of elements the index accepts
    pub capacity: usize,
    /// Fixed RNG seed for reproducible graphs
    pub seed: Option<u64>,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            metric: Metric::Cosine,
            capacity: 1000,
            seed: None,
        }
    }
}

/// HNSW Index
#[derive(Debug)]
pub struct HNSW {
    pub(crate) nodes: Vec<Node>,
    /// Row-major `len() x dim` matrix of prepared vectors
    pub(crate) vectors: Vec<f32>,
    pub(crate) dim: usize,
    pub(crate) metric: Metric,
    pub(crate) entry_point: Option<u32>,
    pub(crate) max_layer: usize,
    pub(crate) m: usize,
    pub(crate) m0: usize,
    pub(crate) ml: f64,
    pub(crate) ef_construction: usize,
    pub(crate) capacity: usize,
    rng: StdRng,
}

impl HNSW {
    /// Create an empty index for `dim`-dimensional vectors
    pub fn new(dim: usize, config: HnswConfig) -> Result<Self, HnswError> {
        validate_params(dim, config.m, config.ef_construction)?;
        let seed = config.seed.unwrap_or_else(rand::random);
        Ok(Self {
            nodes: Vec::with_capacity(config.capacity),
            vectors: Vec::with_capacity(config.capacity.saturating_mul(dim)),
            dim,
            metric: config.metric,
            entry_point: None,
            max_layer: 0,
            m: config.m,
            m0: config.m * 2,
            ml: level_multiplier(config.m),
            ef_construction: config.ef_construction,
            capacity: config.capacity,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Reassemble an index from decoded parts (used by deserialization)
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        nodes: Vec<Node>,
        vectors: Vec<f32>,
        dim: usize,
        metric: Metric,
        entry_point: Option<u32>,
        max_layer: usize,
        m: usize,
        m0: usize,
        ef_construction: usize,
        capacity: usize,
    ) -> Self {
        Self {
            nodes,
            vectors,
            dim,
            metric,
            entry_point,
            max_layer,
            m,
            m0,
            ml: level_multiplier(m),
            ef_construction,
            capacity,
            rng: StdRng::seed_from_u64(rand::random()),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn m(&self) -> usize {
        self.m
    }

    pub fn ef_construction(&self) -> usize {
        self.ef_construction
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Stored (prepared) vector for a label
    #[inline]
    pub fn vector(&self, label: u32) -> Option<&[f32]> {
        let start = (label as usize).checked_mul(self.dim)?;
        self.vectors.get(start..start + self.dim)
    }

    #[inline]
    fn row(&self, label: u32) -> &[f32] {
        let start = label as usize * self.dim;
        &self.vectors[start..start + self.dim]
    }

    #[inline]
    fn distance_to(&self, query: &[f32], label: u32) -> f32 {
        self.metric.distance(query, self.row(label))
    }

    /// Assign a random layer based on exponential distribution
    fn random_layer(&mut self) -> usize {
        let r: f64 = self.rng.gen_range(f64::MIN_POSITIVE..1.0);
        ((-r.ln() * self.ml).floor() as usize).min(MAX_LAYER)
    }

    /// Insert a vector; its label is the number of vectors inserted before it.
    pub fn insert(&mut self, vector: &[f32]) -> Result<u32, HnswError> {
        if vector.len() != self.dim {
            return Err(HnswError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if self.nodes.len() >= self.capacity || self.nodes.len() >= u32::MAX as usize {
            return Err(HnswError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let label = self.nodes.len() as u32;
        let prepared = self.metric.prepare(vector);
        self.vectors.extend_from_slice(&prepared);

        let node_layer = self.random_layer();
        let mut node = Node::new(node_layer);

        let Some(entry_point) = self.entry_point else {
            self.entry_point = Some(label);
            self.max_layer = node_layer;
            self.nodes.push(node);
            return Ok(label);
        };

        let mut current = entry_point;

        // Phase 1: greedy descent through layers above the new node's top
        for layer in (node_layer + 1..=self.max_layer).rev() {
            if let Some(nearest) = self.search_layer(&prepared, &[current], 1, layer).first() {
                current = nearest.label;
            }
        }

        // Phase 2: link on every layer the node shares with the graph.
        // Edits to existing nodes are collected first and applied afterwards.
        let mut reverse_edges: Vec<(u32, usize)> = Vec::new();
        let mut pruned: Vec<(u32, usize, Vec<u32>)> = Vec::new();

        for layer in (0..=node_layer.min(self.max_layer)).rev() {
            let limit = if layer == 0 { self.m0 } else { self.m };
            let candidates =
                self.search_layer(&prepared, &[current], self.ef_construction, layer);
            let selected = self.select_neighbors(&candidates, limit);

            for neighbor in &selected {
                node.link(layer, neighbor.label);

                let existing = self.nodes[neighbor.label as usize].neighbors(layer);
                if existing.len() < limit {
                    reverse_edges.push((neighbor.label, layer));
                    continue;
                }

                // Neighbor is full: re-select its list including the new node
                let base = self.row(neighbor.label);
                let mut pool: Vec<Neighbor> = existing
                    .iter()
                    .map(|&n| Neighbor {
                        label: n,
                        distance: self.metric.distance(base, self.row(n)),
                    })
                    .collect();
                pool.push(Neighbor {
                    label,
                    distance: self.metric.distance(base, &prepared),
                });
                pool.sort();
                let kept = self
                    .select_neighbors(&pool, limit)
                    .into_iter()
                    .map(|n| n.label)
                    .collect();
                pruned.push((neighbor.label, layer, kept));
            }

            if let Some(first) = candidates.first() {
                current = first.label;
            }
        }

        for (target, layer) in reverse_edges {
            self.nodes[target as usize].link(layer, label);
        }
        for (target, layer, kept) in pruned {
            self.nodes[target as usize].set_neighbors(layer, kept);
        }

        if node_layer > self.max_layer {
            self.max_layer = node_layer;
            self.entry_point = Some(label);
        }
        self.nodes.push(node);
        Ok(label)
    }

    /// Beam search on a single layer, returning up to `ef` hits sorted by distance
    fn search_layer(&self, query: &[f32], entry_points: &[u32], ef: usize, layer: usize) -> Vec<Neighbor> {
        let ef = ef.max(1);
        let mut visited = VisitedGuard::new(self.nodes.len());
        let mut frontier: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<Neighbor> = BinaryHeap::with_capacity(ef + 1);

        for &ep in entry_points {
            if visited.insert(ep) {
                let distance = self.distance_to(query, ep);
                frontier.push(Candidate { label: ep, distance });
                results.push(Neighbor { label: ep, distance });
            }
        }

        while let Some(current) = frontier.pop() {
            if let Some(worst) = results.peek() {
                if results.len() >= ef && current.distance > worst.distance {
                    break;
                }
            }

            for &next in self.nodes[current.label as usize].neighbors(layer) {
                if !visited.insert(next) {
                    continue;
                }
                let distance = self.distance_to(query, next);
                let dominated = results.len() >= ef
                    && results.peek().is_some_and(|worst| distance > worst.distance);
                if dominated {
                    continue;
                }

                frontier.push(Candidate { label: next, distance });
                results.push(Neighbor { label: next, distance });
                if results.len() > ef {
                    results.pop();
                }
            }
        }

        results.into_sorted_vec()
    }

    /// Diversity-preserving neighbor selection.
    ///
    /// `candidates` must be sorted by distance. A candidate is kept only if it
    /// is closer to the base point than to every neighbor already kept; the
    /// remaining slots are then back-filled with the closest leftovers.
    fn select_neighbors(&self, candidates: &[Neighbor], limit: usize) -> Vec<Neighbor> {
        let mut kept: Vec<Neighbor> = Vec::with_capacity(limit);

        for candidate in candidates {
            if kept.len() >= limit {
                break;
            }
            let candidate_vec = self.row(candidate.label);
            let diverse = kept.iter().all(|existing| {
                self.metric.distance(candidate_vec, self.row(existing.label)) >= candidate.distance
            });
            if diverse {
                kept.push(*candidate);
            }
        }

        if kept.len() < limit {
            for candidate in candidates {
                if kept.len() >= limit {
                    break;
                }
                if !kept.iter().any(|n| n.label == candidate.label) {
                    kept.push(*candidate);
                }
            }
        }

        kept
    }

    /// Approximate k-nearest-neighbor query.
    ///
    /// `ef` is the candidate list size on layer 0; values below `k` are raised
    /// to `k`. Results are sorted closest first.
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<Neighbor>, HnswError> {
        if query.len() != self.dim {
            return Err(HnswError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        let Some(entry_point) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = self.metric.prepare(query);
        let mut current = entry_point;

        for layer in (1..=self.max_layer).rev() {
            if let Some(nearest) = self.search_layer(&query, &[current], 1, layer).first() {
                current = nearest.label;
            }
        }

        let mut hits = self.search_layer(&query, &[current], ef.max(k), 0);
        hits.truncate(k);
        Ok(hits)
    }

    /// Get statistics about the index
    pub fn stats(&self) -> HnswStats {
        let mut layer_counts = vec![0usize; self.max_layer + 1];
        let mut total_edges = 0;

        for node in &self.nodes {
            for (layer, neighbors) in node.layers.iter().enumerate() {
                if let Some(count) = layer_counts.get_mut(layer) {
                    *count += 1;
                }
                total_edges += neighbors.len();
            }
        }

        HnswStats {
            num_nodes: self.nodes.len(),
            dim: self.dim,
            metric: self.metric,
            max_layer: self.max_layer,
            layer_counts,
            total_edges,
            m: self.m,
            ef_construction: self.ef_construction,
            capacity: self.capacity,
        }
    }
}

/// Statistics about the HNSW index
#[derive(Debug, Clone)]
pub struct HnswStats {
    pub num_nodes: usize,
    pub dim: usize,
    pub metric: Metric,
    pub max_layer: usize,
    pub layer_counts: Vec<usize>,
    pub total_edges: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub capacity: usize,
}

fn level_multiplier(m: usize) -> f64 {
    1.0 / (m as f64).ln()
}

pub(crate) fn validate_params(dim: usize, m: usize, ef_construction: usize) -> Result<(), HnswError> {
    if dim == 0 {
        return Err(HnswError::InvalidParams("dimension must be > 0".into()));
    }
    if m < 2 {
        return Err(HnswError::InvalidParams(format!("m must be >= 2, got {m}")));
    }
    if ef_construction == 0 {
        return Err(HnswError::InvalidParams("ef_construction must be > 0".into()));
    }
    Ok(())
}

/// Labels reachable from the entry point on layer 0. Used by tests to check
/// the graph is connected.
#[cfg(test)]
pub(crate) fn reachable_from_entry(index: &HNSW) -> std::collections::HashSet<u32> {
    let mut seen = std::collections::HashSet::new();
    let Some(ep) = index.entry_point else {
        return seen;
    };
    let mut stack = vec![ep];
    while let Some(label) = stack.pop() {
        if seen.insert(label) {
            stack.extend_from_slice(index.nodes[label as usize].neighbors(0));
        }
    }
    seen
}
