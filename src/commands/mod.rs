// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subcommand implementations for the evidex binary

pub mod embed;
pub mod ingest;
pub mod search;
pub mod stats;

use anyhow::Result;
use std::path::{Path, PathBuf};

use evidex::config::Config;
use evidex::errors::IndexNotFoundError;
use evidex::utils::{resolve_index_dir, LEXICAL_DIR};

/// Resolved on-disk layout of one index.
pub struct IndexLayout {
    pub root: PathBuf,
    pub store: PathBuf,
    pub lexical: PathBuf,
}

impl IndexLayout {
    pub fn resolve(explicit: Option<&Path>, config: &Config) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let root = resolve_index_dir(explicit, &cwd);
        Self {
            store: config.store.dir(&root),
            lexical: root.join(LEXICAL_DIR),
            root,
        }
    }

    /// Fails when nothing has been ingested into this index yet.
    pub fn require_existing(&self) -> Result<()> {
        if !self.store.is_dir() {
            return Err(IndexNotFoundError {
                index_path: self.root.display().to_string(),
            }
            .into());
        }
        Ok(())
    }
}
