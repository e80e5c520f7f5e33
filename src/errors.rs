// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types shared by the retrieval core.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used by the store, cache, embedding and fusion modules.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors surfaced by the embedding and retrieval engine.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// An embedding or reduction input has the wrong length.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding backend failed (network, HTTP status, malformed body).
    #[error("embedding provider failure: {message}")]
    Provider { message: String, retryable: bool },

    /// Disk I/O failed while loading or atomically saving persisted state.
    #[error("persistence failure at {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted record could not be decoded.
    #[error("corrupt record at line {line}: {reason}")]
    CorruptRecord { line: usize, reason: String },

    /// Setup defect: missing credential, invalid option, unusable provider.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Durable embedding cache failure.
    #[error("embedding cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    /// Lexical collaborator failure.
    #[error("lexical search error: {0}")]
    Lexical(String),
}

impl RetrievalError {
    /// Builds a provider error that the retry policy will retry.
    pub fn transient(message: impl Into<String>) -> Self {
        RetrievalError::Provider {
            message: message.into(),
            retryable: true,
        }
    }

    /// Builds a provider error that is surfaced without retrying.
    pub fn permanent(message: impl Into<String>) -> Self {
        RetrievalError::Provider {
            message: message.into(),
            retryable: false,
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RetrievalError::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Whether the retry policy should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RetrievalError::Provider {
                retryable: true,
                ..
            }
        )
    }
}

impl From<tantivy::TantivyError> for RetrievalError {
    fn from(err: tantivy::TantivyError) -> Self {
        RetrievalError::Lexical(err.to_string())
    }
}

/// Error returned when no index directory exists yet.
#[derive(Debug, Error)]
#[error("No index found at {index_path}. Run `evidex ingest` first.")]
pub struct IndexNotFoundError {
    pub index_path: String,
}
