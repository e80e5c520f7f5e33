// SPDX-License-Identifier: MIT OR Apache-2.0

//! Content-addressed embedding cache.
//!
//! Durable entries live in SQLite keyed by `(hash, model)`; a bounded
//! in-memory LRU sits in front of it. The LRU is a derived view and may be
//! dropped at any time. Both layers are guarded by their own mutex so the
//! cache can be shared between concurrent embedding calls.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{Result, RetrievalError};

/// Fraction of durable rows evicted once the ceiling is exceeded.
const EVICT_FRACTION: f64 = 0.05;

/// SQLite host-parameter budget per `IN (...)` lookup.
const MAX_LOOKUP_VARS: usize = 400;

/// Lookup key: content hash of the raw text plus the model that embedded it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub hash: String,
    pub model: String,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            model: model.into(),
        }
    }
}

/// A cached vector and the dimension it was stored at.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedVector {
    pub dim: usize,
    pub vector: Vec<f32>,
}

/// Entry handed to [`EmbeddingCacheStore::put_many`].
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub dim: usize,
    pub vector: Vec<f32>,
}

/// Cache interface consumed by the embedding client.
pub trait EmbeddingCacheStore: Send + Sync {
    /// Returns the hits among `keys`; absent keys are misses.
    fn get_many(&self, keys: &[CacheKey]) -> Result<HashMap<CacheKey, CachedVector>>;

    /// Stores entries, replacing any existing entry with the same key.
    fn put_many(&self, entries: &[CacheEntry]) -> Result<()>;
}

/// Bounded least-recently-used map.
#[derive(Debug)]
struct HotLru {
    capacity: usize,
    tick: u64,
    entries: HashMap<CacheKey, (u64, CachedVector)>,
    recency: BTreeMap<u64, CacheKey>,
}

impl HotLru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &CacheKey) -> Option<CachedVector> {
        if self.capacity == 0 {
            return None;
        }
        let tick = self.next_tick();
        let (old_tick, value) = self.entries.get_mut(key)?;
        self.recency.remove(old_tick);
        *old_tick = tick;
        self.recency.insert(tick, key.clone());
        Some(value.clone())
    }

    fn put(&mut self, key: CacheKey, value: CachedVector) {
        if self.capacity == 0 {
            return;
        }
        let tick = self.next_tick();
        if let Some((old_tick, _)) = self.entries.insert(key.clone(), (tick, value)) {
            self.recency.remove(&old_tick);
        }
        self.recency.insert(tick, key);

        while self.entries.len() > self.capacity {
            match self.recency.pop_first() {
                Some((_, oldest)) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// SQLite-backed embedding cache with a hot LRU layer.
pub struct SqliteEmbeddingCache {
    conn: Mutex<Connection>,
    hot: Mutex<HotLru>,
    max_rows: u64,
    path: PathBuf,
}

impl SqliteEmbeddingCache {
    /// Opens or creates a cache database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P, max_rows: u64, hot_capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RetrievalError::persistence(parent, e))?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY;",
        )?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            hot: Mutex::new(HotLru::new(hot_capacity)),
            max_rows,
            path,
        })
    }

    /// Opens an in-memory cache (tests, throwaway runs).
    pub fn in_memory(max_rows: u64, hot_capacity: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            hot: Mutex::new(HotLru::new(hot_capacity)),
            max_rows,
            path: PathBuf::from(":memory:"),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS embeds (
                hash TEXT NOT NULL,
                model TEXT NOT NULL,
                dim INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                vec BLOB NOT NULL,
                PRIMARY KEY (hash, model)
            );

            CREATE INDEX IF NOT EXISTS idx_embeds_ts ON embeds(ts);
            "#,
        )?;
        Ok(())
    }

    /// Returns the path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counts durable rows.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeds", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Number of entries currently held in memory.
    pub fn hot_len(&self) -> usize {
        self.hot.lock().len()
    }

    fn fetch_durable(&self, keys: &[CacheKey]) -> Result<Vec<(CacheKey, CachedVector)>> {
        let mut by_model: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for key in keys {
            by_model.entry(&key.model).or_default().push(&key.hash);
        }

        let conn = self.conn.lock();
        let mut found = Vec::new();

        for (model, hashes) in by_model {
            for chunk in hashes.chunks(MAX_LOOKUP_VARS) {
                let mut query =
                    String::from("SELECT hash, dim, vec FROM embeds WHERE model = ?1 AND hash IN (");
                for i in 0..chunk.len() {
                    if i > 0 {
                        query.push_str(", ");
                    }
                    query.push_str(&format!("?{}", i + 2));
                }
                query.push(')');

                let mut params_vec: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
                params_vec.push(&model);
                for hash in chunk {
                    params_vec.push(hash);
                }

                let mut stmt = conn.prepare(&query)?;
                let rows = stmt
                    .query_map(params_vec.as_slice(), |row| {
                        let hash: String = row.get(0)?;
                        let dim: i64 = row.get(1)?;
                        let blob: Vec<u8> = row.get(2)?;
                        Ok((
                            CacheKey::new(hash, model),
                            CachedVector {
                                dim: dim as usize,
                                vector: blob_to_embedding(&blob),
                            },
                        ))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                found.extend(rows);
            }
        }

        Ok(found)
    }

    fn evict_if_needed(&self, conn: &Connection) -> Result<usize> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeds", [], |row| row.get(0))?;
        let count = count as u64;
        if count <= self.max_rows {
            return Ok(0);
        }

        let to_delete = ((count as f64 * EVICT_FRACTION) as i64).max(1);
        let deleted = conn.execute(
            r#"
            DELETE FROM embeds WHERE rowid IN (
                SELECT rowid FROM embeds ORDER BY ts ASC, rowid ASC LIMIT ?1
            )
            "#,
            params![to_delete],
        )?;
        tracing::info!(
            rows = count,
            evicted = deleted,
            ceiling = self.max_rows,
            "evicted oldest embedding cache rows"
        );
        Ok(deleted)
    }
}

impl EmbeddingCacheStore for SqliteEmbeddingCache {
    fn get_many(&self, keys: &[CacheKey]) -> Result<HashMap<CacheKey, CachedVector>> {
        let mut hits = HashMap::with_capacity(keys.len());
        let mut to_fetch = Vec::new();

        {
            let mut hot = self.hot.lock();
            for key in keys {
                if hits.contains_key(key) {
                    continue;
                }
                match hot.get(key) {
                    Some(value) => {
                        hits.insert(key.clone(), value);
                    }
                    None => to_fetch.push(key.clone()),
                }
            }
        }

        if to_fetch.is_empty() {
            return Ok(hits);
        }
        to_fetch.sort();
        to_fetch.dedup();

        let durable = self.fetch_durable(&to_fetch)?;
        let mut hot = self.hot.lock();
        for (key, value) in durable {
            hot.put(key.clone(), value.clone());
            hits.insert(key, value);
        }

        Ok(hits)
    }

    fn put_many(&self, entries: &[CacheEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let ts = now_millis();

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    r#"
                    INSERT INTO embeds (hash, model, dim, ts, vec)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(hash, model) DO UPDATE SET
                        dim = excluded.dim,
                        ts = excluded.ts,
                        vec = excluded.vec
                    "#,
                )?;
                for entry in entries {
                    stmt.execute(params![
                        entry.key.hash,
                        entry.key.model,
                        entry.dim as i64,
                        ts,
                        embedding_to_blob(&entry.vector)
                    ])?;
                }
            }
            self.evict_if_needed(&tx)?;
            tx.commit()?;
        }

        let mut hot = self.hot.lock();
        for entry in entries {
            hot.put(
                entry.key.clone(),
                CachedVector {
                    dim: entry.dim,
                    vector: entry.vector.clone(),
                },
            );
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Converts an embedding vector to a compact blob.
fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Converts a blob back to an embedding vector.
fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
