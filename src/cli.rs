// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// evidex - Evidence retrieval over documents
///
/// Ingests JSONL documents into a vector store and a BM25 index, then answers
/// semantic, keyword and hybrid queries over them.
#[derive(Parser, Debug)]
#[command(name = "evidex")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true)]
    pub format: Option<OutputFormat>,

    /// Compact JSON output (no pretty formatting)
    #[arg(long, global = true)]
    pub compact: bool,

    /// Index directory (defaults to the nearest .evidex)
    #[arg(long, global = true)]
    pub index: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Search mode for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CliSearchMode {
    /// BM25 keyword search only
    Keyword,
    /// Embedding-based semantic search only
    Semantic,
    /// Combined BM25 + embedding search
    #[default]
    Hybrid,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest JSONL documents (files or directories)
    Ingest {
        /// Input files or directories containing *.jsonl
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Append chunks without removing earlier chunks of the same id
        #[arg(long)]
        append: bool,

        /// Documents per embedding batch
        #[arg(long, default_value_t = 64)]
        batch: usize,

        /// Hide the progress bar
        #[arg(short = 'q', long)]
        quiet: bool,
    },

    /// Search ingested documents
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(short = 'k', long = "limit")]
        max_results: Option<usize>,

        /// Search mode
        #[arg(short, long, value_enum)]
        mode: Option<CliSearchMode>,

        /// Restrict to these spaces (repeatable)
        #[arg(long = "space")]
        spaces: Vec<String>,

        /// Restrict to these document types (repeatable)
        #[arg(short = 't', long = "type")]
        types: Vec<String>,
    },

    /// Print the embedding of a text as JSON
    Embed {
        /// Text to embed
        text: String,
    },

    /// Show index statistics
    Stats,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_search_flags() {
        let cli = Cli::parse_from([
            "evidex", "search", "deploy", "-k", "3", "--mode", "semantic", "--space", "ENG",
            "--space", "OPS", "--type", "page", "--format", "json",
        ]);
        assert_eq!(cli.format, Some(OutputFormat::Json));
        match cli.command {
            Commands::Search {
                query,
                max_results,
                mode,
                spaces,
                types,
            } => {
                assert_eq!(query, "deploy");
                assert_eq!(max_results, Some(3));
                assert_eq!(mode, Some(CliSearchMode::Semantic));
                assert_eq!(spaces, vec!["ENG", "OPS"]);
                assert_eq!(types, vec!["page"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
