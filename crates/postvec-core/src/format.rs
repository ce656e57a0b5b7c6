//! .pvec raw embeddings file format
//!
//! Keeps the exact vectors a generation was built from so a later build can
//! re-index without calling the embedder again.
//!
//! # File Structure
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     8       [u8; 8]     Magic: "PVEMB001"
//! 0x08     4       u32 LE      N: Number of vectors
//! 0x0C     4       u32 LE      D: Dimensions
//! 0x10     1       u8          Quantization code (0 = float32)
//! 0x11     3       -           Reserved (zero)
//! 0x14     N*D*4   [f32]       Vector data (Little Endian), row i = label i
//! ...      N x     [u32 len][utf-8]   Document ids
//! ...      1 x     [u32 len][utf-8]   Model id
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic bytes identifying a .pvec file: "PVEMB001"
pub const MAGIC: [u8; 8] = *b"PVEMB001";

/// Header size in bytes; keeps the row section 4-byte aligned
pub const HEADER_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid magic bytes: expected PVEMB001")]
    InvalidMagic,

    #[error("Unsupported quantization code {0}")]
    UnsupportedQuantization(u8),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Truncated file: needed {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Invalid embeddings file: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Element encoding of stored vectors. Only full precision today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    Float32,
}

impl Quantization {
    pub fn code(self) -> u8 {
        match self {
            Quantization::Float32 => 0,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FormatError> {
        match code {
            0 => Ok(Quantization::Float32),
            other => Err(FormatError::UnsupportedQuantization(other)),
        }
    }

    /// Bytes per vector element
    pub fn element_size(self) -> usize {
        match self {
            Quantization::Float32 => std::mem::size_of::<f32>(),
        }
    }
}

/// Parsed .pvec header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvecHeader {
    pub count: u32,
    pub dimensions: u32,
    pub quantization: Quantization,
}

impl PvecHeader {
    /// Parse header from the first [`HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated {
                needed: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let count = read_u32(&bytes[8..12]);
        let dimensions = read_u32(&bytes[12..16]);
        let quantization = Quantization::from_code(bytes[16])?;

        Ok(Self {
            count,
            dimensions,
            quantization,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        buf[16] = self.quantization.code();
        buf
    }

    /// Byte offset of row `index`
    #[inline(always)]
    pub fn offset(&self, index: usize) -> usize {
        HEADER_SIZE + index * self.row_bytes()
    }

    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.dimensions as usize * self.quantization.element_size()
    }

    /// End of the row section, where the id table starts
    pub fn rows_end(&self) -> Option<usize> {
        (self.count as usize)
            .checked_mul(self.row_bytes())
            .and_then(|n| n.checked_add(HEADER_SIZE))
    }
}

/// Streaming writer for .pvec data.
///
/// Rows are written as they arrive; ids are buffered and appended by
/// [`PvecWriter::finish`], which also patches the header count.
pub struct PvecWriter<W: Write + Seek> {
    writer: W,
    dimensions: usize,
    model_id: String,
    ids: Vec<String>,
}

impl PvecWriter<BufWriter<File>> {
    /// Create a .pvec file at `path`
    pub fn create<P: AsRef<Path>>(
        path: P,
        dimensions: usize,
        model_id: &str,
    ) -> Result<Self, FormatError> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), dimensions, model_id)
    }
}

impl<W: Write + Seek> PvecWriter<W> {
    pub fn new(mut writer: W, dimensions: usize, model_id: &str) -> Result<Self, FormatError> {
        let dims = u32::try_from(dimensions)
            .map_err(|_| FormatError::Invalid(format!("dimensions {dimensions} exceed u32")))?;
        // Placeholder header, count patched in finish()
        let header = PvecHeader {
            count: 0,
            dimensions: dims,
            quantization: Quantization::Float32,
        };
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            writer,
            dimensions,
            model_id: model_id.to_string(),
            ids: Vec::new(),
        })
    }

    /// Append one row and its document id
    pub fn write_vector(&mut self, id: &str, vector: &[f32]) -> Result<(), FormatError> {
        if vector.len() != self.dimensions {
            return Err(FormatError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        for &val in vector {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.ids.push(id.to_string());
        Ok(())
    }

    /// Write the id table and final header; returns the inner writer and row count
    pub fn finish(mut self) -> Result<(W, u32), FormatError> {
        let count = u32::try_from(self.ids.len())
            .map_err(|_| FormatError::Invalid("too many rows for a .pvec file".into()))?;

        for id in &self.ids {
            write_str(&mut self.writer, id)?;
        }
        write_str(&mut self.writer, &self.model_id)?;

        self.writer.seek(SeekFrom::Start(8))?;
        self.writer.write_all(&count.to_le_bytes())?;
        self.writer.seek(SeekFrom::End(0))?;
        self.writer.flush()?;

        Ok((self.writer, count))
    }
}

/// Encode a complete .pvec blob in memory
pub fn encode<'a, I>(dimensions: usize, model_id: &str, rows: I) -> Result<Vec<u8>, FormatError>
where
    I: IntoIterator<Item = (&'a str, &'a [f32])>,
{
    let mut writer = PvecWriter::new(io::Cursor::new(Vec::new()), dimensions, model_id)?;
    for (id, vector) in rows {
        writer.write_vector(id, vector)?;
    }
    let (cursor, _) = writer.finish()?;
    Ok(cursor.into_inner())
}

fn write_str<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    writer.write_all(&(s.len() as u32).to_le_bytes())?;
    writer.write_all(s.as_bytes())
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Parse the trailing id table: `count` ids followed by the model id.
pub(crate) fn read_id_table(tail: &[u8], count: usize) -> Result<(Vec<String>, String), FormatError> {
    let mut pos = 0usize;
    let mut next = |what: &str| -> Result<String, FormatError> {
        let len_end = pos + 4;
        if len_end > tail.len() {
            return Err(FormatError::Invalid(format!("truncated {what} length")));
        }
        let len = read_u32(&tail[pos..len_end]) as usize;
        let end = len_end
            .checked_add(len)
            .filter(|&e| e <= tail.len())
            .ok_or_else(|| FormatError::Invalid(format!("truncated {what}")))?;
        let s = std::str::from_utf8(&tail[len_end..end])
            .map_err(|_| FormatError::Invalid(format!("{what} is not valid UTF-8")))?
            .to_string();
        pos = end;
        Ok(s)
    };

    let mut ids = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        ids.push(next("document id")?);
    }
    let model_id = next("model id")?;

    if pos != tail.len() {
        return Err(FormatError::Invalid(format!(
            "{} trailing bytes after id table",
            tail.len() - pos
        )));
    }
    Ok((ids, model_id))
}
