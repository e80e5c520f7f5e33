// SPDX-License-Identifier: MIT OR Apache-2.0

//! Search command implementation

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::Value;
use std::path::Path;

use evidex::config::Config;
use evidex::embedding::EmbeddingClient;
use evidex::hybrid::{FusedHit, HybridConfig, HybridSearcher, SearchMode, SearchOutcome};
use evidex::lexical::{LexicalIndex, LexicalSearch};
use evidex::output::{
    colorize_facet, colorize_id, colorize_score, colorize_snippet, colorize_title, to_json,
    use_colors,
};
use evidex::store::{SearchFilters, VectorStore};

use super::IndexLayout;
use crate::cli::OutputFormat;

pub struct SearchArgs<'a> {
    pub query: &'a str,
    pub max_results: Option<usize>,
    pub mode: SearchMode,
    pub spaces: &'a [String],
    pub types: &'a [String],
}

pub fn run(
    args: SearchArgs<'_>,
    index: Option<&Path>,
    format: OutputFormat,
    compact: bool,
) -> Result<()> {
    let config = Config::load()?;
    let layout = IndexLayout::resolve(index, &config);
    layout.require_existing()?;

    let store = VectorStore::open(&layout.store, config.embedding.dimension())?;
    let client = EmbeddingClient::from_config_with_dim(&config, &layout.root, store.effective_dim())
        .context("Failed to set up the embedding client")?;
    let lexical = LexicalIndex::open_existing(&layout.lexical)?;
    if lexical.is_none() && args.mode != SearchMode::Semantic {
        tracing::warn!(path = %layout.lexical.display(), "no lexical index; keyword channel is empty");
    }

    let filters = SearchFilters::new()
        .spaces(args.spaces)
        .types(args.types);

    let searcher = HybridSearcher::new(
        &client,
        &store,
        lexical.as_ref().map(|l| l as &dyn LexicalSearch),
        HybridConfig::from_config(&config.hybrid),
    );
    let k = config.merge_max_results(args.max_results);
    let outcome = searcher.search(args.mode, args.query, k, &filters)?;

    match format {
        OutputFormat::Json => println!("{}", to_json(&outcome, compact)?),
        OutputFormat::Text => print_text(args.query, &outcome),
    }
    Ok(())
}

fn field<'a>(hit: &'a FusedHit, name: &str) -> Option<&'a str> {
    hit.fields
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn print_text(query: &str, outcome: &SearchOutcome) {
    let use_color = use_colors();

    if outcome.fallback {
        eprintln!("Warning: embedding query failed; showing keyword results only.");
    }

    if outcome.hits.is_empty() {
        if use_color {
            println!("{} No results found for: {}", "✗".red(), query.yellow());
        } else {
            println!("No results found for: {}", query);
        }
        return;
    }

    println!(
        "\nFound {} results for: {} ({})\n",
        outcome.hits.len(),
        query,
        outcome.mode
    );

    for (rank, hit) in outcome.hits.iter().enumerate() {
        let facets: Vec<&str> = ["space", "type"]
            .iter()
            .filter_map(|name| field(hit, name))
            .collect();
        let facets = if facets.is_empty() {
            String::new()
        } else {
            format!(" [{}]", colorize_facet(&facets.join("/"), use_color))
        };
        println!(
            "{:>2}. {} {}{}",
            rank + 1,
            colorize_score(hit.score, use_color),
            colorize_id(&hit.id, use_color),
            facets
        );
        if let Some(title) = field(hit, "title") {
            println!("    {}", colorize_title(title, use_color));
        }
        if let Some(url) = field(hit, "url") {
            println!("    {}", url);
        }
        if let Some(snippet) = field(hit, "snippet") {
            let line = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
            let line: String = line.chars().take(160).collect();
            println!("    {}", colorize_snippet(&line, use_color));
        }
        println!();
    }
}
