// SPDX-License-Identifier: MIT OR Apache-2.0

//! evidex - Evidence retrieval CLI
//!
//! Ingests JSONL documents into a memory-mapped vector store and a tantivy
//! BM25 index, and answers semantic, keyword and hybrid queries.

mod cli;
mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, CliSearchMode, Commands};
use evidex::hybrid::SearchMode;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Initialize tracing with EVIDEX_LOG env var (e.g., EVIDEX_LOG=debug evidex search "query")
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("EVIDEX_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let format = cli.format.unwrap_or_default();
    let index = cli.index.as_deref();

    match cli.command {
        Commands::Ingest {
            paths,
            append,
            batch,
            quiet,
        } => {
            commands::ingest::run(
                commands::ingest::IngestArgs {
                    paths: &paths,
                    append,
                    batch,
                    quiet,
                },
                index,
                format,
                cli.compact,
            )?;
        }
        Commands::Search {
            query,
            max_results,
            mode,
            spaces,
            types,
        } => {
            let mode = match mode.unwrap_or_default() {
                CliSearchMode::Keyword => SearchMode::Keyword,
                CliSearchMode::Semantic => SearchMode::Semantic,
                CliSearchMode::Hybrid => SearchMode::Hybrid,
            };
            commands::search::run(
                commands::search::SearchArgs {
                    query: &query,
                    max_results,
                    mode,
                    spaces: &spaces,
                    types: &types,
                },
                index,
                format,
                cli.compact,
            )?;
        }
        Commands::Embed { text } => {
            commands::embed::run(&text, index, cli.compact)?;
        }
        Commands::Stats => {
            commands::stats::run(index, format, cli.compact)?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "evidex", &mut std::io::stdout());
        }
    }

    Ok(())
}
