//! Raw embeddings store reader
//!
//! Opens .pvec data either from a file (memory-mapped, zero-copy rows) or
//! from an owned buffer fetched over the network.
//!
//! # Safety
//!
//! Mapped rows are converted with `bytemuck::try_cast_slice`, which checks
//! alignment. The row section starts at a 4-byte aligned offset, so a
//! page-aligned mapping always satisfies it.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::format::{read_id_table, FormatError, PvecHeader, Quantization, HEADER_SIZE};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index out of bounds: {index} >= {count}")]
    IndexOutOfBounds { index: usize, count: usize },

    #[error("Alignment error: byte slice not aligned to f32 (4 bytes)")]
    AlignmentError,
}

enum Rows {
    Mapped(Mmap),
    Owned(Vec<f32>),
}

/// Vectors of one generation plus the document id of each row
pub struct EmbeddingStore {
    rows: Rows,
    ids: Vec<String>,
    model_id: String,
    quantization: Quantization,
    count: usize,
    dim: usize,
}

impl std::fmt::Debug for EmbeddingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingStore")
            .field("count", &self.count)
            .field("dim", &self.dim)
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl EmbeddingStore {
    /// Open a .pvec file for reading.
    ///
    /// The file must not be modified or truncated while the store is open.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the file must not be truncated or rewritten while this
        // store is alive. Generation directories are updated by rename.
        let mmap = unsafe { Mmap::map(&file)? };
        let (header, ids, model_id) = parse(&mmap)?;
        tracing::debug!(
            "Mapped embeddings store {:?}: count={} dim={}",
            path,
            header.count,
            header.dimensions
        );

        Ok(Self {
            rows: Rows::Mapped(mmap),
            ids,
            model_id,
            quantization: header.quantization,
            count: header.count as usize,
            dim: header.dimensions as usize,
        })
    }

    /// Decode a .pvec blob held in memory
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let (header, ids, model_id) = parse(bytes)?;
        let start = HEADER_SIZE;
        let end = header.offset(header.count as usize);
        // Owned buffers carry no alignment guarantee, so copy rows out
        let rows: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes[start..end]);

        Ok(Self {
            rows: Rows::Owned(rows),
            ids,
            model_id,
            quantization: header.quantization,
            count: header.count as usize,
            dim: header.dimensions as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn quantization(&self) -> Quantization {
        self.quantization
    }

    /// Document ids in row order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Row `index` as a slice
    pub fn try_get(&self, index: usize) -> Result<&[f32], StoreError> {
        if index >= self.count {
            return Err(StoreError::IndexOutOfBounds {
                index,
                count: self.count,
            });
        }

        match &self.rows {
            Rows::Mapped(mmap) => {
                let start = HEADER_SIZE + index * self.dim * std::mem::size_of::<f32>();
                let end = start + self.dim * std::mem::size_of::<f32>();
                bytemuck::try_cast_slice(&mmap[start..end]).map_err(|_| StoreError::AlignmentError)
            }
            Rows::Owned(rows) => Ok(&rows[index * self.dim..(index + 1) * self.dim]),
        }
    }

    /// Iterate `(id, vector)` pairs in row order
    pub fn iter(&self) -> impl Iterator<Item = Result<(&str, &[f32]), StoreError>> + '_ {
        (0..self.count).map(move |i| Ok((self.ids[i].as_str(), self.try_get(i)?)))
    }
}

fn parse(bytes: &[u8]) -> Result<(PvecHeader, Vec<String>, String), FormatError> {
    let header = PvecHeader::from_bytes(bytes)?;
    let rows_end = header
        .rows_end()
        .ok_or_else(|| FormatError::Invalid("row section size overflows".into()))?;
    if bytes.len() < rows_end {
        return Err(FormatError::Truncated {
            needed: rows_end,
            actual: bytes.len(),
        });
    }
    let (ids, model_id) = read_id_table(&bytes[rows_end..], header.count as usize)?;
    Ok((header, ids, model_id))
}
