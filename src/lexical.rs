// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lexical search channel using tantivy for BM25 ranking
//!
//! Hybrid search only needs ranked `{id, score, fields}` items for a query, so
//! the channel is expressed as the [`LexicalSearch`] trait. [`LexicalIndex`]
//! is the on-disk implementation used by the CLI.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tantivy::{
    collector::TopDocs,
    doc,
    query::QueryParser,
    schema::{Field, Schema, Value as _, STORED, STRING, TEXT},
    Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term,
};

use crate::errors::{Result, RetrievalError};
use crate::store::Metadata;

/// Writer heap for a single ingestion batch.
const WRITER_HEAP_BYTES: usize = 50_000_000;

/// A ranked lexical match.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub id: String,
    pub score: f32,
    /// Stored fields of the document (`title`, `space`, `type`, `url`)
    pub fields: Metadata,
}

/// A ranked term-match engine.
pub trait LexicalSearch: Send + Sync {
    fn search(&self, query: &str, k: usize) -> Result<Vec<LexicalHit>>;
}

/// One document handed to the lexical index.
#[derive(Debug, Clone, Default)]
pub struct LexicalDocument {
    pub id: String,
    pub title: String,
    pub body: String,
    pub space: String,
    pub kind: String,
    pub url: String,
}

/// Tantivy field handles
struct LexicalFields {
    id: Field,
    title: Field,
    body: Field,
    space: Field,
    kind: Field,
    url: Field,
}

impl LexicalFields {
    fn schema() -> Schema {
        let mut schema_builder = Schema::builder();
        schema_builder.add_text_field("id", STRING | STORED);
        schema_builder.add_text_field("title", TEXT | STORED);
        schema_builder.add_text_field("body", TEXT);
        schema_builder.add_text_field("space", STRING | STORED);
        schema_builder.add_text_field("type", STRING | STORED);
        schema_builder.add_text_field("url", STORED);
        schema_builder.build()
    }

    fn resolve(schema: &Schema) -> Result<Self> {
        let field = |name: &str| {
            schema
                .get_field(name)
                .map_err(|_| RetrievalError::Lexical(format!("missing {} field", name)))
        };
        Ok(Self {
            id: field("id")?,
            title: field("title")?,
            body: field("body")?,
            space: field("space")?,
            kind: field("type")?,
            url: field("url")?,
        })
    }
}

/// BM25 index over document titles and bodies.
pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    fields: LexicalFields,
    path: Option<PathBuf>,
}

impl LexicalIndex {
    /// Opens the index in `dir`, creating it when absent.
    pub fn open_or_create(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)?
        } else {
            fs::create_dir_all(dir).map_err(|e| RetrievalError::persistence(dir, e))?;
            Index::create_in_dir(dir, LexicalFields::schema())?
        };
        Self::from_index(index, Some(dir.to_path_buf()))
    }

    /// Opens an existing index; `None` when nothing was ingested yet.
    pub fn open_existing(dir: impl AsRef<Path>) -> Result<Option<Self>> {
        let dir = dir.as_ref();
        if !dir.join("meta.json").exists() {
            return Ok(None);
        }
        let index = Index::open_in_dir(dir)?;
        Self::from_index(index, Some(dir.to_path_buf())).map(Some)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_index(Index::create_in_ram(LexicalFields::schema()), None)
    }

    fn from_index(index: Index, path: Option<PathBuf>) -> Result<Self> {
        let fields = LexicalFields::resolve(&index.schema())?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            index,
            reader,
            fields,
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of searchable documents.
    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Indexes `docs`, replacing any earlier document with the same id.
    pub fn replace_documents(&self, docs: &[LexicalDocument]) -> Result<usize> {
        if docs.is_empty() {
            return Ok(0);
        }
        let mut writer: IndexWriter = self.index.writer(WRITER_HEAP_BYTES)?;
        for d in docs {
            writer.delete_term(Term::from_field_text(self.fields.id, &d.id));
            writer.add_document(doc!(
                self.fields.id => d.id.as_str(),
                self.fields.title => d.title.as_str(),
                self.fields.body => d.body.as_str(),
                self.fields.space => d.space.as_str(),
                self.fields.kind => d.kind.as_str(),
                self.fields.url => d.url.as_str(),
            ))?;
        }
        writer.commit()?;
        self.reader.reload()?;
        tracing::debug!(count = docs.len(), "indexed lexical documents");
        Ok(docs.len())
    }

    fn stored_str(doc: &TantivyDocument, field: Field) -> String {
        doc.get_first(field)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    }
}

impl LexicalSearch for LexicalIndex {
    fn search(&self, query: &str, k: usize) -> Result<Vec<LexicalHit>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.fields.title, self.fields.body]);
        let (parsed_query, errors) = parser.parse_query_lenient(query);
        if !errors.is_empty() {
            tracing::debug!(query, errors = errors.len(), "lenient query parse dropped terms");
        }

        let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(k))?;
        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            let doc: TantivyDocument = searcher.doc(doc_address)?;
            let mut fields = Metadata::new();
            for (name, field) in [
                ("title", self.fields.title),
                ("space", self.fields.space),
                ("type", self.fields.kind),
                ("url", self.fields.url),
            ] {
                fields.insert(name.to_string(), Value::String(Self::stored_str(&doc, field)));
            }
            hits.push(LexicalHit {
                id: Self::stored_str(&doc, self.fields.id),
                score,
                fields,
            });
        }
        Ok(hits)
    }
}
