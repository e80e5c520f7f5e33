// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSONL document ingestion: chunk, embed, then write the vector store and
//! the lexical index.
//!
//! Each input line is one document `{id, space, type, title, text, url?,
//! updated_at?, ...}`. Unknown fields are carried into the chunk metadata.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::embedding::{EmbeddingChunker, EmbeddingClient};
use crate::errors::RetrievalError;
use crate::lexical::{LexicalDocument, LexicalIndex};
use crate::store::{Metadata, VectorRecord, VectorStore};

/// Characters of chunk text kept as `snippet` metadata.
pub const SNIPPET_CHARS: usize = 300;

/// One input document.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    #[serde(default)]
    pub space: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "updated")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: Metadata,
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub documents: usize,
    pub skipped_short: usize,
    pub skipped_invalid: usize,
    pub chunks: usize,
    pub inserted: usize,
    pub replaced: usize,
}

impl IngestReport {
    fn merge(&mut self, other: IngestReport) {
        self.documents += other.documents;
        self.skipped_short += other.skipped_short;
        self.skipped_invalid += other.skipped_invalid;
        self.chunks += other.chunks;
        self.inserted += other.inserted;
        self.replaced += other.replaced;
    }
}

/// Expands directories into their `*.jsonl` files, sorted by path.
pub fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            anyhow::bail!("Input not found: {}", path.display());
        }
    }
    Ok(files)
}

/// Parses a JSONL file, skipping blank and malformed lines.
pub fn read_documents(path: &Path) -> Result<(Vec<SourceDocument>, usize)> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut docs = Vec::new();
    let mut invalid = 0usize;
    for (ix, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SourceDocument>(line) {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                invalid += 1;
                let err = RetrievalError::CorruptRecord {
                    line: ix + 1,
                    reason: e.to_string(),
                };
                tracing::warn!(path = %path.display(), error = %err, "skipping document");
            }
        }
    }
    Ok((docs, invalid))
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

/// Writes documents into the vector store and, when present, the lexical index.
pub struct Ingestor<'a> {
    client: &'a EmbeddingClient,
    store: &'a mut VectorStore,
    lexical: Option<&'a LexicalIndex>,
    chunker: EmbeddingChunker,
    append: bool,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        client: &'a EmbeddingClient,
        store: &'a mut VectorStore,
        lexical: Option<&'a LexicalIndex>,
        chunker: EmbeddingChunker,
    ) -> Self {
        Self {
            client,
            store,
            lexical,
            chunker,
            append: false,
        }
    }

    /// Keep earlier rows of re-ingested ids instead of replacing them.
    pub fn append_only(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// Ingests one batch of documents.
    pub fn ingest_documents(&mut self, docs: &[SourceDocument]) -> Result<IngestReport> {
        let mut report = IngestReport {
            documents: docs.len(),
            ..Default::default()
        };

        let mut texts = Vec::new();
        let mut metadata = Vec::new();
        let mut lexical_docs = Vec::new();
        let mut ids = Vec::new();

        for doc in docs {
            let chunks = self.chunker.chunk_document(&doc.text);
            if chunks.is_empty() {
                report.skipped_short += 1;
                continue;
            }

            ids.push(doc.id.clone());
            let url = doc.url.clone().unwrap_or_default();
            for chunk in chunks {
                let mut meta = doc.extra.clone();
                meta.insert("id".into(), Value::String(doc.id.clone()));
                meta.insert("space".into(), Value::String(doc.space.clone()));
                meta.insert("type".into(), Value::String(doc.kind.clone()));
                meta.insert("title".into(), Value::String(doc.title.clone()));
                meta.insert("url".into(), Value::String(url.clone()));
                meta.insert("chunk_ix".into(), Value::from(chunk.index));
                meta.insert(
                    "updated_at".into(),
                    Value::String(doc.updated_at.clone().unwrap_or_default()),
                );
                meta.insert("snippet".into(), Value::String(snippet(&chunk.text)));
                metadata.push(meta);
                texts.push(chunk.text);
            }

            lexical_docs.push(LexicalDocument {
                id: doc.id.clone(),
                title: doc.title.clone(),
                body: doc.text.clone(),
                space: doc.space.clone(),
                kind: doc.kind.clone(),
                url,
            });
        }

        if texts.is_empty() {
            return Ok(report);
        }
        report.chunks = texts.len();

        let embeddings = self
            .client
            .embed_texts(&texts)
            .context("Failed to embed chunks")?;

        if !self.append {
            report.replaced = self
                .store
                .delete_by_ids(&ids)
                .context("Failed to remove previous chunks")?;
        }

        let records: Vec<VectorRecord> = metadata
            .into_iter()
            .zip(embeddings)
            .map(|(meta, embedding)| {
                let id = meta
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                VectorRecord {
                    id,
                    embedding,
                    metadata: meta,
                }
            })
            .collect();
        report.inserted = self
            .store
            .upsert(records)
            .context("Failed to write vector store")?;

        if let Some(lexical) = self.lexical {
            lexical
                .replace_documents(&lexical_docs)
                .context("Failed to update lexical index")?;
        }

        Ok(report)
    }

    /// Ingests every JSONL file in `paths`, `batch` documents at a time.
    pub fn ingest_paths(&mut self, paths: &[PathBuf], batch: usize, progress: bool) -> Result<IngestReport> {
        let files = collect_inputs(paths)?;
        let mut loaded = Vec::new();
        let mut report = IngestReport::default();
        for file in &files {
            let (docs, invalid) = read_documents(file)?;
            report.skipped_invalid += invalid;
            loaded.extend(docs);
        }

        let pb = if progress {
            ProgressBar::new(loaded.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {pos}/{len} documents | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##."),
        );

        for batch_docs in loaded.chunks(batch.max(1)) {
            pb.set_message(batch_docs[0].id.clone());
            let batch_report = self.ingest_documents(batch_docs)?;
            tracing::info!(
                documents = batch_report.documents,
                chunks = batch_report.chunks,
                inserted = batch_report.inserted,
                "ingested batch"
            );
            report.merge(batch_report);
            pb.inc(batch_docs.len() as u64);
        }
        pb.finish_and_clear();

        tracing::info!(
            files = files.len(),
            documents = report.documents,
            chunks = report.inserted,
            "ingestion complete"
        );
        Ok(report)
    }
}
