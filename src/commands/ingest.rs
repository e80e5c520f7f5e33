// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ingest command implementation

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use evidex::config::Config;
use evidex::embedding::{ChunkConfig, EmbeddingChunker, EmbeddingClient};
use evidex::ingest::Ingestor;
use evidex::lexical::LexicalIndex;
use evidex::output::{to_json, use_colors};
use evidex::store::VectorStore;

use super::IndexLayout;
use crate::cli::OutputFormat;

pub struct IngestArgs<'a> {
    pub paths: &'a [PathBuf],
    pub append: bool,
    pub batch: usize,
    pub quiet: bool,
}

pub fn run(
    args: IngestArgs<'_>,
    index: Option<&Path>,
    format: OutputFormat,
    compact: bool,
) -> Result<()> {
    let start = Instant::now();
    let config = Config::load()?;
    let layout = IndexLayout::resolve(index, &config);

    let mut store = VectorStore::open(&layout.store, config.embedding.dimension())
        .with_context(|| format!("Failed to open vector store at {}", layout.store.display()))?;
    let client = EmbeddingClient::from_config_with_dim(&config, &layout.root, store.effective_dim())
        .context("Failed to set up the embedding client")?;
    let lexical = LexicalIndex::open_or_create(&layout.lexical)
        .with_context(|| format!("Failed to open lexical index at {}", layout.lexical.display()))?;
    let chunker = EmbeddingChunker::new(ChunkConfig::from_config(&config.chunking)?);

    let show_progress = !args.quiet && format == OutputFormat::Text;
    let report = Ingestor::new(&client, &mut store, Some(&lexical), chunker)
        .append_only(args.append)
        .ingest_paths(args.paths, args.batch, show_progress)?;

    match format {
        OutputFormat::Json => println!("{}", to_json(&report, compact)?),
        OutputFormat::Text => {
            let elapsed = start.elapsed();
            let summary = format!(
                "Ingested {} documents ({} chunks) into {} in {:.2}s",
                report.documents,
                report.inserted,
                layout.root.display(),
                elapsed.as_secs_f64()
            );
            if use_colors() {
                println!("{} {}", "✓".green(), summary);
            } else {
                println!("{}", summary);
            }
            if report.skipped_short > 0 || report.skipped_invalid > 0 {
                println!(
                    "  skipped: {} too short, {} invalid",
                    report.skipped_short, report.skipped_invalid
                );
            }
            if report.replaced > 0 {
                println!("  replaced {} earlier chunks", report.replaced);
            }
        }
    }
    Ok(())
}
