//! Native binary encoding of a built index.
//!
//! ```text
//! Offset  Size       Field
//! 0x00    8          Magic "PVHNSW01"
//! 0x08    1          Metric code
//! 0x09    1          Max layer
//! 0x0A    2          Reserved (zero)
//! 0x0C    4          Dimensions
//! 0x10    4          Node count N
//! 0x14    4          Capacity
//! 0x18    4          M
//! 0x1C    4          M0
//! 0x20    4          ef_construction
//! 0x24    4          Entry point (u32::MAX if empty)
//! 0x28    N*D*4      Vectors, f32 LE, row per label
//! ...     per node   [layer_count: u8] then per layer [count: u32][labels: u32 x count]
//! ```
//!
//! The blob is an atomic unit: decoding rejects truncated input and
//! trailing bytes.

use std::io::{self, Write};
use std::path::Path;

use super::index::{validate_params, MAX_LAYER};
use super::metric::Metric;
use super::node::Node;
use super::{HnswError, HNSW};

/// Magic bytes identifying a serialized index
pub const INDEX_MAGIC: [u8; 8] = *b"PVHNSW01";

const HEADER_SIZE: usize = 0x28;
const NO_ENTRY: u32 = u32::MAX;

impl HNSW {
    /// Serialize the graph and its vectors to a writer.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&INDEX_MAGIC)?;
        writer.write_all(&[self.metric.code(), self.max_layer as u8, 0, 0])?;
        for value in [
            self.dim as u32,
            self.nodes.len() as u32,
            self.capacity as u32,
            self.m as u32,
            self.m0 as u32,
            self.ef_construction as u32,
            self.entry_point.unwrap_or(NO_ENTRY),
        ] {
            writer.write_all(&value.to_le_bytes())?;
        }

        for value in &self.vectors {
            writer.write_all(&value.to_le_bytes())?;
        }

        for node in &self.nodes {
            writer.write_all(&[node.layers.len() as u8])?;
            for neighbors in &node.layers {
                writer.write_all(&(neighbors.len() as u32).to_le_bytes())?;
                for &n in neighbors {
                    writer.write_all(&n.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }

    /// Encode into an owned buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.vectors.len() * 4);
        // Writing into a Vec cannot fail
        let _ = self.serialize(&mut buf);
        buf
    }

    /// Save the index to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = io::BufWriter::new(file);
        self.serialize(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Load an index file written by [`HNSW::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, HnswError> {
        let bytes = std::fs::read(path.as_ref())?;
        let index = Self::from_bytes(&bytes)?;
        tracing::debug!(
            "Loaded index {:?}: count={} dim={} max_layer={}",
            path.as_ref(),
            index.len(),
            index.dim,
            index.max_layer
        );
        Ok(index)
    }

    /// Decode an index blob, validating structure and bounds.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HnswError> {
        let mut r = Cursor::new(bytes);

        if r.take(8)? != INDEX_MAGIC {
            return Err(HnswError::Corrupt("invalid index magic".into()));
        }
        let metric_code = r.u8()?;
        let metric = Metric::from_code(metric_code)
            .ok_or_else(|| HnswError::Corrupt(format!("unknown metric code {metric_code}")))?;
        let max_layer = r.u8()? as usize;
        r.take(2)?;

        let dim = r.u32()? as usize;
        let count = r.u32()? as usize;
        let capacity = r.u32()? as usize;
        let m = r.u32()? as usize;
        let m0 = r.u32()? as usize;
        let ef_construction = r.u32()? as usize;
        let entry_raw = r.u32()?;

        validate_params(dim, m, ef_construction).map_err(|e| HnswError::Corrupt(e.to_string()))?;
        if m.checked_mul(2) != Some(m0) {
            return Err(HnswError::Corrupt(format!("layer-0 link limit {m0} must be 2 * m ({m})")));
        }
        if max_layer > MAX_LAYER {
            return Err(HnswError::Corrupt(format!("max layer {max_layer} exceeds {MAX_LAYER}")));
        }
        if count > capacity {
            return Err(HnswError::Corrupt(format!(
                "node count {count} exceeds capacity {capacity}"
            )));
        }

        let entry_point = match (entry_raw, count) {
            (NO_ENTRY, 0) => None,
            (NO_ENTRY, _) => return Err(HnswError::Corrupt("non-empty index without entry point".into())),
            (ep, _) if ep as usize >= count => {
                return Err(HnswError::Corrupt(format!("entry point {ep} out of bounds for {count} nodes")))
            }
            (ep, _) => Some(ep),
        };

        let vector_bytes = count
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| HnswError::Corrupt("vector section size overflows".into()))?;
        let vectors: Vec<f32> = r
            .take(vector_bytes)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut nodes = Vec::with_capacity(count);
        for label in 0..count {
            let layer_count = r.u8()? as usize;
            if layer_count == 0 || layer_count > max_layer + 1 {
                return Err(HnswError::Corrupt(format!(
                    "node {label} has {layer_count} layers, graph max layer is {max_layer}"
                )));
            }
            let mut layers = Vec::with_capacity(layer_count);
            for layer in 0..layer_count {
                let n = r.u32()? as usize;
                let limit = if layer == 0 { m0 } else { m };
                if n > limit {
                    return Err(HnswError::Corrupt(format!(
                        "node {label} has {n} links on layer {layer}, limit {limit}"
                    )));
                }
                // Link lists are only as long as the bytes that remain
                let mut neighbors = Vec::with_capacity(n.min(r.remaining() / 4));
                for _ in 0..n {
                    let neighbor = r.u32()?;
                    if neighbor as usize >= count {
                        return Err(HnswError::Corrupt(format!(
                            "neighbor {neighbor} of node {label} out of bounds for {count} nodes"
                        )));
                    }
                    neighbors.push(neighbor);
                }
                layers.push(neighbors);
            }
            nodes.push(Node { layers });
        }

        if !r.is_empty() {
            return Err(HnswError::Corrupt(format!("{} trailing bytes after index", r.remaining())));
        }

        Ok(HNSW::from_parts(
            nodes,
            vectors,
            dim,
            metric,
            entry_point,
            max_layer,
            m,
            m0,
            ef_construction,
            capacity,
        ))
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], HnswError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| HnswError::Corrupt(format!("truncated index at byte {}", self.pos)))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, HnswError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, HnswError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    use super::*;
    use crate::hnsw::HnswConfig;

    fn sample_index(n: usize, dim: usize) -> HNSW {
        let mut rng = StdRng::seed_from_u64(99);
        let mut index = HNSW::new(
            dim,
            HnswConfig {
                m: 8,
                ef_construction: 40,
                capacity: n * 2,
                seed: Some(3),
                ..HnswConfig::default()
            },
        )
        .unwrap();
        for _ in 0..n {
            let v: Vec<f32> = (0..dim).map(|_| rng.gen::<f32>() - 0.5).collect();
            index.insert(&v).unwrap();
        }
        index
    }

    #[test]
    fn test_roundtrip_preserves_graph_and_results() {
        let index = sample_index(150, 12);
        let decoded = HNSW::from_bytes(&index.to_bytes()).unwrap();

        assert_eq!(decoded.nodes(), index.nodes());
        assert_eq!(decoded.entry_point(), index.entry_point());
        assert_eq!(decoded.capacity(), 300);
        assert_eq!(decoded.metric(), Metric::Cosine);

        let query = index.vector(17).unwrap().to_vec();
        let before = index.search(&query, 5, 50).unwrap();
        let after = decoded.search(&query, 5, 50).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let index = sample_index(20, 4);
        index.save(&path).unwrap();

        let loaded = HNSW::load(&path).unwrap();
        assert_eq!(loaded.len(), 20);
        assert_eq!(loaded.dim(), 4);
    }

    #[test]
    fn test_empty_index_roundtrip() {
        let index = HNSW::new(3, HnswConfig::default()).unwrap();
        let decoded = HNSW::from_bytes(&index.to_bytes()).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.entry_point(), None);
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        let bytes = sample_index(30, 8).to_bytes();
        for cut in [0, 7, HEADER_SIZE - 1, HEADER_SIZE + 5, bytes.len() - 1] {
            assert!(
                matches!(HNSW::from_bytes(&bytes[..cut]), Err(HnswError::Corrupt(_))),
                "cut at {cut} should fail"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = sample_index(5, 4).to_bytes();
        bytes.push(0);
        assert!(matches!(HNSW::from_bytes(&bytes), Err(HnswError::Corrupt(_))));
    }

    #[test]
    fn test_bad_magic_and_out_of_bounds_neighbor() {
        let mut bytes = sample_index(5, 4).to_bytes();
        bytes[0] = b'X';
        assert!(HNSW::from_bytes(&bytes).is_err());

        let mut bytes = sample_index(5, 4).to_bytes();
        // First neighbor of node 0 sits right after the vectors, layer byte and count
        let first_neighbor = HEADER_SIZE + 5 * 4 * 4 + 1 + 4;
        bytes[first_neighbor..first_neighbor + 4].copy_from_slice(&77u32.to_le_bytes());
        assert!(matches!(HNSW::from_bytes(&bytes), Err(HnswError::Corrupt(_))));
    }

    /// One-node, 4-dim index with a single layer-0 link count and no links
    fn single_node_blob(m: u32, m0: u32, links: u32) -> Vec<u8> {
        let mut bytes = INDEX_MAGIC.to_vec();
        bytes.push(Metric::Cosine.code());
        bytes.push(0);
        bytes.extend_from_slice(&[0, 0]);
        for field in [4u32, 1, 1, m, m0, 200, 0] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        for x in [1.0f32, 0.0, 0.0, 0.0] {
            bytes.extend_from_slice(&x.to_le_bytes());
        }
        bytes.push(1);
        bytes.extend_from_slice(&links.to_le_bytes());
        bytes
    }

    #[test]
    fn test_huge_link_counts_fail_without_allocating() {
        let bytes = single_node_blob(16, u32::MAX, u32::MAX - 1);
        assert_eq!(bytes.len(), 61);
        assert!(matches!(HNSW::from_bytes(&bytes), Err(HnswError::Corrupt(_))));

        let bytes = single_node_blob(16, 32, u32::MAX - 1);
        assert!(matches!(HNSW::from_bytes(&bytes), Err(HnswError::Corrupt(_))));

        // Valid limits, but the claimed links are missing
        let bytes = single_node_blob(16, 32, 32);
        assert!(matches!(HNSW::from_bytes(&bytes), Err(HnswError::Corrupt(_))));

        let bytes = single_node_blob(16, 32, 0);
        let index = HNSW::from_bytes(&bytes).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_layer0_limit_must_be_twice_m() {
        for m0 in [0, 8, 31, 33] {
            let bytes = single_node_blob(16, m0, 0);
            assert!(
                matches!(HNSW::from_bytes(&bytes), Err(HnswError::Corrupt(_))),
                "m0={m0} accepted"
            );
        }
    }
}
