// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stats command implementation

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use evidex::config::Config;
use evidex::embedding::SqliteEmbeddingCache;
use evidex::lexical::LexicalIndex;
use evidex::output::{colorize_facet, colorize_title, to_json, use_colors};
use evidex::store::{StoreStats, VectorStore};

use super::IndexLayout;
use crate::cli::OutputFormat;

#[derive(Serialize)]
struct IndexStats {
    index: String,
    store: StoreStats,
    lexical_documents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_embeddings: Option<u64>,
}

pub fn run(index: Option<&Path>, format: OutputFormat, compact: bool) -> Result<()> {
    let config = Config::load()?;
    let layout = IndexLayout::resolve(index, &config);
    layout.require_existing()?;

    let store = VectorStore::open(&layout.store, config.embedding.dimension())?;
    let lexical_documents = LexicalIndex::open_existing(&layout.lexical)?
        .map(|l| l.num_docs())
        .unwrap_or(0);

    let cache_path = config.cache.path(&layout.root);
    let cached_embeddings = if config.cache.enabled() && cache_path.exists() {
        SqliteEmbeddingCache::open(&cache_path, config.cache.max_rows(), 0)
            .and_then(|cache| cache.count())
            .map_err(|err| tracing::warn!(path = %cache_path.display(), error = %err, "cannot read embedding cache"))
            .ok()
    } else {
        None
    };

    let stats = IndexStats {
        index: layout.root.display().to_string(),
        store: store.stats(),
        lexical_documents,
        cached_embeddings,
    };

    match format {
        OutputFormat::Json => println!("{}", to_json(&stats, compact)?),
        OutputFormat::Text => print_text(&stats),
    }
    Ok(())
}

fn print_facets(label: &str, counts: &BTreeMap<String, usize>, use_color: bool) {
    if counts.is_empty() {
        return;
    }
    println!("{}:", label);
    for (name, count) in counts {
        println!("  {:<24} {}", colorize_facet(name, use_color), count);
    }
}

fn print_text(stats: &IndexStats) {
    let use_color = use_colors();
    println!("{}", colorize_title(&format!("Index: {}", stats.index), use_color));
    println!("  chunks:            {}", stats.store.rows);
    println!("  dimension:         {}", stats.store.dim);
    println!("  lexical documents: {}", stats.lexical_documents);
    if let Some(cached) = stats.cached_embeddings {
        println!("  cached embeddings: {}", cached);
    }
    print_facets("Spaces", &stats.store.spaces, use_color);
    print_facets("Types", &stats.store.types, use_color);
}
