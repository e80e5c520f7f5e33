// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk layout of the vector store.
//!
//! ## Vector File Format (Version 1)
//!
//! ```text
//! [magic "EVEC" 4B]
//! [version u32 LE]
//! [dimension u32 LE]
//! [count u64 LE]
//! [embeddings: count * dimension f32 LE, row-major]
//! ```
//!
//! Metadata lives next to it in `meta.jsonl`, one JSON object per row in row
//! order. Both files are replaced through `*.tmp` + rename.

use memmap2::Mmap;
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errors::{Result, RetrievalError};

/// Magic bytes identifying an evidex vector file
const MAGIC: &[u8; 4] = b"EVEC";
/// Current format version
const VERSION: u32 = 1;
/// Header size: magic(4) + version(4) + dimension(4) + count(8)
pub(crate) const HEADER_SIZE: usize = 4 + 4 + 4 + 8;

pub const VECTORS_FILE: &str = "vectors.bin";
pub const METADATA_FILE: &str = "meta.jsonl";

/// Metadata attached to one row.
pub type Metadata = Map<String, Value>;

/// Dense row-major vector array, either mapped from disk or owned.
pub(crate) enum VectorData {
    Mapped {
        mmap: Mmap,
        dim: usize,
        rows: usize,
    },
    Owned {
        data: Vec<f32>,
        dim: usize,
    },
}

impl VectorData {
    pub(crate) fn empty(dim: usize) -> Self {
        VectorData::Owned {
            data: Vec::new(),
            dim,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        match self {
            VectorData::Mapped { dim, .. } | VectorData::Owned { dim, .. } => *dim,
        }
    }

    pub(crate) fn rows(&self) -> usize {
        match self {
            VectorData::Mapped { rows, .. } => *rows,
            VectorData::Owned { data, dim } => {
                if *dim == 0 {
                    0
                } else {
                    data.len() / dim
                }
            }
        }
    }

    /// Dot product of row `row` with `query`.
    pub(crate) fn dot(&self, row: usize, query: &[f32]) -> f32 {
        match self {
            VectorData::Mapped { mmap, dim, .. } => {
                let start = HEADER_SIZE + row * dim * 4;
                let bytes = &mmap[start..start + dim * 4];
                bytes
                    .chunks_exact(4)
                    .zip(query)
                    .map(|(b, q)| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * q)
                    .sum()
            }
            VectorData::Owned { data, dim } => {
                let start = row * dim;
                data[start..start + dim]
                    .iter()
                    .zip(query)
                    .map(|(a, b)| a * b)
                    .sum()
            }
        }
    }

    /// Copy of row `row`.
    pub(crate) fn row(&self, row: usize) -> Vec<f32> {
        match self {
            VectorData::Mapped { mmap, dim, .. } => {
                let start = HEADER_SIZE + row * dim * 4;
                decode_f32s(&mmap[start..start + dim * 4])
            }
            VectorData::Owned { data, dim } => data[row * dim..(row + 1) * dim].to_vec(),
        }
    }

    /// Switches to an owned buffer so rows can be appended or removed.
    pub(crate) fn make_owned(&mut self) -> &mut Vec<f32> {
        if let VectorData::Mapped { mmap, dim, rows } = self {
            let dim = *dim;
            let end = HEADER_SIZE + *rows * dim * 4;
            let data = decode_f32s(&mmap[HEADER_SIZE..end]);
            *self = VectorData::Owned { data, dim };
        }
        match self {
            VectorData::Owned { data, .. } => data,
            VectorData::Mapped { .. } => unreachable!("vector data was just materialized"),
        }
    }

    /// Keeps only the first `rows` rows.
    pub(crate) fn truncate(&mut self, rows: usize) {
        let dim = self.dim();
        self.make_owned().truncate(rows * dim);
    }

    fn write_body(&self, out: &mut impl Write) -> io::Result<()> {
        match self {
            VectorData::Mapped { mmap, dim, rows } => {
                out.write_all(&mmap[HEADER_SIZE..HEADER_SIZE + rows * dim * 4])
            }
            VectorData::Owned { data, .. } => {
                for value in data {
                    out.write_all(&value.to_le_bytes())?;
                }
                Ok(())
            }
        }
    }
}

fn decode_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Maps the vector file read-only. A short file yields only its complete rows.
pub(crate) fn open_vectors(path: &Path) -> Result<VectorData> {
    let file = File::open(path).map_err(|e| RetrievalError::persistence(path, e))?;
    // SAFETY: the mapping is read-only and the store is the single writer; saves
    // replace the file by rename instead of writing into it.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| RetrievalError::persistence(path, e))?;

    if mmap.len() < HEADER_SIZE {
        return Err(RetrievalError::persistence(
            path,
            invalid("vector file too small for header"),
        ));
    }
    if &mmap[0..4] != MAGIC {
        return Err(RetrievalError::persistence(path, invalid("invalid vector file magic")));
    }
    let version = u32::from_le_bytes([mmap[4], mmap[5], mmap[6], mmap[7]]);
    if version != VERSION {
        return Err(RetrievalError::persistence(
            path,
            invalid(format!("unsupported vector file version: {}", version)),
        ));
    }
    let dim = u32::from_le_bytes([mmap[8], mmap[9], mmap[10], mmap[11]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&mmap[12..20]);
    let count = u64::from_le_bytes(count_bytes) as usize;

    let available = if dim == 0 {
        0
    } else {
        (mmap.len() - HEADER_SIZE) / (dim * 4)
    };
    if available < count {
        tracing::warn!(
            path = %path.display(),
            header_rows = count,
            available_rows = available,
            "vector file shorter than its header"
        );
    }

    Ok(VectorData::Mapped {
        mmap,
        dim,
        rows: count.min(available),
    })
}

/// Reads `meta.jsonl`, skipping blank lines and lines that are not valid
/// UTF-8 JSON objects.
pub(crate) fn read_metadata(path: &Path) -> Result<Vec<Metadata>> {
    let content = fs::read(path).map_err(|e| RetrievalError::persistence(path, e))?;
    let mut rows = Vec::new();
    for (ix, raw) in content.split(|&b| b == b'\n').enumerate() {
        let parsed = std::str::from_utf8(raw)
            .map_err(|e| e.to_string())
            .and_then(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return Ok(None);
                }
                serde_json::from_str::<Metadata>(line)
                    .map(Some)
                    .map_err(|e| e.to_string())
            });
        match parsed {
            Ok(Some(meta)) => rows.push(meta),
            Ok(None) => {}
            Err(reason) => {
                let err = RetrievalError::CorruptRecord {
                    line: ix + 1,
                    reason,
                };
                tracing::warn!(path = %path.display(), error = %err, "skipping metadata line");
            }
        }
    }
    Ok(rows)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_synced(path: &Path, write: impl FnOnce(&mut BufWriter<&File>) -> io::Result<()>) -> io::Result<()> {
    let file = File::create(path)?;
    {
        let mut out = BufWriter::new(&file);
        write(&mut out)?;
        out.flush()?;
    }
    file.sync_all()
}

/// Writes both files to `*.tmp`, then renames vectors and metadata into place.
pub(crate) fn save(dir: &Path, vectors: &VectorData, metadata: &[Metadata]) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| RetrievalError::persistence(dir, e))?;
    let vectors_path = dir.join(VECTORS_FILE);
    let metadata_path = dir.join(METADATA_FILE);
    let vectors_tmp = tmp_path(&vectors_path);
    let metadata_tmp = tmp_path(&metadata_path);

    write_synced(&vectors_tmp, |out| {
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&(vectors.dim() as u32).to_le_bytes())?;
        out.write_all(&(vectors.rows() as u64).to_le_bytes())?;
        vectors.write_body(out)
    })
    .map_err(|e| RetrievalError::persistence(&vectors_tmp, e))?;

    write_synced(&metadata_tmp, |out| {
        for meta in metadata {
            serde_json::to_writer(&mut *out, meta)?;
            out.write_all(b"\n")?;
        }
        Ok(())
    })
    .map_err(|e| RetrievalError::persistence(&metadata_tmp, e))?;

    fs::rename(&vectors_tmp, &vectors_path)
        .map_err(|e| RetrievalError::persistence(&vectors_path, e))?;
    fs::rename(&metadata_tmp, &metadata_path)
        .map_err(|e| RetrievalError::persistence(&metadata_path, e))?;
    Ok(())
}
