// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic random projection between embedding dimensions.
//!
//! A `Reducer` maps `in_dim` vectors to `out_dim` vectors with a fixed
//! Gaussian matrix scaled by `1/sqrt(out_dim)`. The matrix is derived from a
//! seed and cached on disk as `rp_{rows}x{cols}_seed{seed}.bin`, so vectors
//! reduced in earlier runs stay comparable with freshly reduced queries.
//!
//! ## File Format
//!
//! ```text
//! [magic "ERPM" 4B]
//! [rows u32 LE]
//! [cols u32 LE]
//! [seed u64 LE]
//! [rows * cols f32 LE, row-major]
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{Result, RetrievalError};

const MAGIC: &[u8; 4] = b"ERPM";
const HEADER_SIZE: usize = 4 + 4 + 4 + 8;

/// Fixed linear projection from `in_dim` to `out_dim`.
#[derive(Debug, Clone)]
pub struct Reducer {
    in_dim: usize,
    out_dim: usize,
    seed: u64,
    /// Row-major `out_dim x in_dim`
    matrix: Vec<f32>,
}

impl Reducer {
    /// Builds the projection in memory without touching disk.
    pub fn generate(in_dim: usize, out_dim: usize, seed: u64) -> Result<Self> {
        validate_dims(in_dim, out_dim)?;
        Ok(Self {
            in_dim,
            out_dim,
            seed,
            matrix: gaussian_matrix(out_dim, in_dim, seed),
        })
    }

    /// Loads the cached matrix for `(out_dim, in_dim, seed)` from `cache_dir`,
    /// generating and persisting it when missing or unreadable.
    pub fn load_or_generate(
        cache_dir: impl AsRef<Path>,
        in_dim: usize,
        out_dim: usize,
        seed: u64,
    ) -> Result<Self> {
        validate_dims(in_dim, out_dim)?;
        let path = matrix_path(cache_dir.as_ref(), out_dim, in_dim, seed);

        if path.exists() {
            match read_matrix(&path, out_dim, in_dim, seed) {
                Ok(matrix) => {
                    tracing::debug!(path = %path.display(), "loaded cached projection matrix");
                    return Ok(Self {
                        in_dim,
                        out_dim,
                        seed,
                        matrix,
                    });
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable projection matrix");
                }
            }
        }

        let reducer = Self::generate(in_dim, out_dim, seed)?;
        if let Err(err) = write_matrix(&path, out_dim, in_dim, seed, &reducer.matrix) {
            tracing::warn!(path = %path.display(), error = %err, "failed to cache projection matrix");
        }
        Ok(reducer)
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Whether this reducer converts `from` into `to`.
    pub fn handles(&self, from: usize, to: usize) -> bool {
        self.in_dim == from && self.out_dim == to
    }

    /// Projects `vector` into the output space.
    ///
    /// A vector already at the output dimension is returned unchanged; any
    /// other length besides `in_dim` is a `DimensionMismatch`.
    pub fn reduce(&self, vector: &[f32]) -> Result<Vec<f32>> {
        if vector.len() == self.out_dim {
            return Ok(vector.to_vec());
        }
        if vector.len() != self.in_dim {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.in_dim,
                actual: vector.len(),
            });
        }

        Ok(self
            .matrix
            .par_chunks_exact(self.in_dim)
            .map(|row| row.iter().zip(vector).map(|(a, b)| a * b).sum::<f32>())
            .collect())
    }
}

fn validate_dims(in_dim: usize, out_dim: usize) -> Result<()> {
    if in_dim == 0 || out_dim == 0 || out_dim > u32::MAX as usize || in_dim > u32::MAX as usize {
        return Err(RetrievalError::Configuration(format!(
            "invalid projection dimensions {}x{}",
            out_dim, in_dim
        )));
    }
    Ok(())
}

/// Cache file path for a `rows x cols` matrix.
pub fn matrix_path(cache_dir: &Path, rows: usize, cols: usize, seed: u64) -> PathBuf {
    cache_dir.join(format!("rp_{}x{}_seed{}.bin", rows, cols, seed))
}

/// Standard normal entries (Box-Muller over a seeded StdRng), scaled by `1/sqrt(rows)`.
fn gaussian_matrix(rows: usize, cols: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let scale = 1.0 / (rows as f64).sqrt();
    let total = rows * cols;
    let mut values = Vec::with_capacity(total);
    while values.len() < total {
        let (z0, z1) = standard_normal_pair(&mut rng);
        values.push((z0 * scale) as f32);
        if values.len() < total {
            values.push((z1 * scale) as f32);
        }
    }
    values
}

pub(crate) fn standard_normal_pair<R: Rng>(rng: &mut R) -> (f64, f64) {
    // gen::<f64>() is in [0, 1); shift to (0, 1] so ln() stays finite
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();
    let radius = (-2.0 * u1.ln()).sqrt();
    let theta = std::f64::consts::TAU * u2;
    (radius * theta.cos(), radius * theta.sin())
}

fn read_matrix(path: &Path, rows: usize, cols: usize, seed: u64) -> std::io::Result<Vec<f32>> {
    let bytes = fs::read(path)?;
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());

    if bytes.len() < HEADER_SIZE || &bytes[0..4] != MAGIC {
        return Err(invalid("invalid projection header"));
    }
    let file_rows = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let file_cols = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut seed_bytes = [0u8; 8];
    seed_bytes.copy_from_slice(&bytes[12..20]);
    let file_seed = u64::from_le_bytes(seed_bytes);

    if file_rows != rows || file_cols != cols || file_seed != seed {
        return Err(invalid("projection shape mismatch"));
    }
    let body = &bytes[HEADER_SIZE..];
    if body.len() != rows * cols * 4 {
        return Err(invalid("projection truncated"));
    }

    Ok(body
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn write_matrix(
    path: &Path,
    rows: usize,
    cols: usize,
    seed: u64,
    matrix: &[f32],
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("bin.tmp");
    {
        let mut file = File::create(&tmp)?;
        let mut buf = Vec::with_capacity(HEADER_SIZE + matrix.len() * 4);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(rows as u32).to_le_bytes());
        buf.extend_from_slice(&(cols as u32).to_le_bytes());
        buf.extend_from_slice(&seed.to_le_bytes());
        for value in matrix {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
