// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistent vector store with exhaustive cosine search.
//!
//! The store keeps a dense `N x D` array of unit vectors and a parallel list
//! of metadata maps, index-aligned. Every mutation rewrites both files through
//! temp-file + rename. A crash between the two renames can leave the files
//! with different row counts; [`VectorStore::open`] detects this, truncates
//! both to the shorter length and persists the healed state.
//!
//! The store is single-writer: `upsert` and `delete_by_ids` take `&mut self`.

mod files;

use rayon::prelude::*;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::embedding::provider::l2_normalize;
use crate::errors::{Result, RetrievalError};
use files::VectorData;

pub use files::{Metadata, METADATA_FILE, VECTORS_FILE};

/// Candidates scored per requested hit before filters are applied.
pub const OVERFETCH_FACTOR: usize = 5;

/// One indexed unit.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            embedding,
            metadata: Metadata::new(),
        }
    }

    /// Adds a metadata field.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A search result with its cosine similarity.
#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub metadata: Metadata,
}

/// Set-membership filters on metadata fields.
///
/// A row passes when, for every filtered field, its value is one of the
/// allowed values. Fields with an empty allowed set are ignored.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    fields: BTreeMap<String, BTreeSet<String>>,
}

impl SearchFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `field` to `values`.
    pub fn with<I, S>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let allowed: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        if !allowed.is_empty() {
            self.fields.insert(field.to_string(), allowed);
        }
        self
    }

    pub fn spaces<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with("space", values)
    }

    pub fn types<I, S>(self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with("type", values)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.fields.iter().all(|(field, allowed)| {
            metadata
                .get(field)
                .and_then(scalar_string)
                .is_some_and(|value| allowed.contains(&value))
        })
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Row and facet counts.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub rows: usize,
    pub dim: usize,
    pub spaces: BTreeMap<String, usize>,
    pub types: BTreeMap<String, usize>,
}

pub struct VectorStore {
    dir: PathBuf,
    vectors: VectorData,
    metadata: Vec<Metadata>,
}

impl VectorStore {
    /// Opens the store in `dir`, mapping the vector file when present.
    ///
    /// `dim` is the dimension of a store without rows; a store with data keeps
    /// the dimension recorded in its file.
    pub fn open(dir: impl AsRef<Path>, dim: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let vectors_path = dir.join(VECTORS_FILE);
        let metadata_path = dir.join(METADATA_FILE);

        let vectors = if vectors_path.exists() {
            let mapped = files::open_vectors(&vectors_path)?;
            if mapped.rows() == 0 || mapped.dim() == 0 {
                VectorData::empty(dim)
            } else {
                mapped
            }
        } else {
            VectorData::empty(dim)
        };
        let metadata = if metadata_path.exists() {
            files::read_metadata(&metadata_path)?
        } else {
            Vec::new()
        };

        let mut store = Self {
            dir,
            vectors,
            metadata,
        };
        store.heal()?;

        tracing::debug!(
            dir = %store.dir.display(),
            rows = store.len(),
            dim = store.effective_dim(),
            "opened vector store"
        );
        Ok(store)
    }

    /// Truncates vectors and metadata to the shorter length and persists.
    fn heal(&mut self) -> Result<()> {
        let rows = self.vectors.rows();
        let metas = self.metadata.len();
        if rows == metas {
            return Ok(());
        }

        let keep = rows.min(metas);
        tracing::warn!(
            dir = %self.dir.display(),
            vectors = rows,
            metadata = metas,
            keep,
            "vector/metadata length mismatch; truncating"
        );
        self.vectors.truncate(keep);
        self.metadata.truncate(keep);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        files::save(&self.dir, &self.vectors, &self.metadata)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Dimension of the live array.
    pub fn effective_dim(&self) -> usize {
        self.vectors.dim()
    }

    /// Metadata of every row, in row order.
    pub fn metadata(&self) -> &[Metadata] {
        &self.metadata
    }

    /// Stored vector of row `row`.
    pub fn vector(&self, row: usize) -> Option<Vec<f32>> {
        (row < self.len()).then(|| self.vectors.row(row))
    }

    /// Appends `records`, returning how many were stored.
    ///
    /// Records whose embedding length differs from the store dimension are
    /// skipped. Embeddings are re-normalized; zero vectors are kept as-is.
    /// Duplicate ids are not merged; call [`VectorStore::delete_by_ids`]
    /// first for replace semantics.
    pub fn upsert(&mut self, records: Vec<VectorRecord>) -> Result<usize> {
        let dim = self.effective_dim();
        let mut accepted = Vec::with_capacity(records.len());
        for record in records {
            if record.embedding.len() != dim {
                let err = RetrievalError::DimensionMismatch {
                    expected: dim,
                    actual: record.embedding.len(),
                };
                tracing::warn!(id = %record.id, error = %err, "rejecting record");
                continue;
            }
            accepted.push(record);
        }
        if accepted.is_empty() {
            return Ok(0);
        }

        let inserted = accepted.len();
        let rows_before = self.len();
        let data = self.vectors.make_owned();
        data.reserve(inserted * dim);
        for record in accepted {
            let VectorRecord {
                id,
                mut embedding,
                mut metadata,
            } = record;
            l2_normalize(&mut embedding);
            data.extend_from_slice(&embedding);
            metadata.insert("id".to_string(), Value::String(id));
            self.metadata.push(metadata);
        }

        if let Err(err) = self.persist() {
            self.vectors.truncate(rows_before);
            self.metadata.truncate(rows_before);
            return Err(err);
        }
        tracing::debug!(inserted, rows = self.len(), "upserted vectors");
        Ok(inserted)
    }

    /// Removes every row whose `id` is in `ids`, preserving the order of the
    /// rest. Returns the number of rows removed.
    pub fn delete_by_ids<S: AsRef<str>>(&mut self, ids: &[S]) -> Result<usize> {
        let targets: HashSet<&str> = ids.iter().map(|s| s.as_ref()).collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let keep: Vec<usize> = self
            .metadata
            .iter()
            .enumerate()
            .filter(|(_, meta)| {
                !meta
                    .get("id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| targets.contains(id))
            })
            .map(|(i, _)| i)
            .collect();

        let removed = self.len() - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let dim = self.effective_dim();
        let mut data = Vec::with_capacity(keep.len() * dim);
        let mut metadata = Vec::with_capacity(keep.len());
        for &i in &keep {
            data.extend_from_slice(&self.vectors.row(i));
            metadata.push(self.metadata[i].clone());
        }
        let vectors = VectorData::Owned { data, dim };
        files::save(&self.dir, &vectors, &metadata)?;
        self.vectors = vectors;
        self.metadata = metadata;

        tracing::debug!(removed, rows = self.len(), "deleted vectors");
        Ok(removed)
    }

    /// Returns up to `k` rows most similar to `query` that pass `filters`.
    ///
    /// The query is normalized here. The top `k * OVERFETCH_FACTOR` rows by
    /// score are filtered; equal scores keep row order.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<VectorHit>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let dim = self.effective_dim();
        if query.len() != dim {
            return Err(RetrievalError::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }

        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let scores: Vec<f32> = (0..self.len())
            .into_par_iter()
            .map(|row| self.vectors.dot(row, &q))
            .collect();

        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        order.truncate(k.saturating_mul(OVERFETCH_FACTOR));

        Ok(order
            .into_iter()
            .filter(|&row| filters.matches(&self.metadata[row]))
            .take(k)
            .map(|row| {
                let metadata = self.metadata[row].clone();
                VectorHit {
                    id: metadata
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    score: scores[row],
                    metadata,
                }
            })
            .collect())
    }

    pub fn stats(&self) -> StoreStats {
        let mut spaces = BTreeMap::new();
        let mut types = BTreeMap::new();
        for meta in &self.metadata {
            if let Some(space) = meta.get("space").and_then(scalar_string) {
                *spaces.entry(space).or_insert(0) += 1;
            }
            if let Some(kind) = meta.get("type").and_then(scalar_string) {
                *types.entry(kind).or_insert(0) += 1;
            }
        }
        StoreStats {
            rows: self.len(),
            dim: self.effective_dim(),
            spaces,
            types,
        }
    }
}
