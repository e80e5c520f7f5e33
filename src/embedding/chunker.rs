// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text chunker for embedding generation.
//!
//! Documents are split into overlapping character windows sized with a
//! token heuristic (about four characters per token), so chunks stay under
//! the provider's input limit without a tokenizer.

use anyhow::{bail, Result};

use crate::config::ChunkingConfig;

/// Characters assumed per token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Default chunk size in tokens.
pub const DEFAULT_TARGET_TOKENS: usize = 800;

/// Default overlap between consecutive chunks in tokens.
pub const DEFAULT_OVERLAP_TOKENS: usize = 100;

/// Documents shorter than this many characters are not chunked.
pub const DEFAULT_MIN_CHARS: usize = 200;

/// Configuration for the text chunker.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Tokens per chunk.
    pub target_tokens: usize,
    /// Tokens shared by consecutive chunks.
    pub overlap_tokens: usize,
    /// Minimum document size in characters.
    pub min_chars: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_tokens: DEFAULT_TARGET_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
            min_chars: DEFAULT_MIN_CHARS,
        }
    }
}

impl ChunkConfig {
    /// Creates a new ChunkConfig with the specified parameters.
    pub fn new(target_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        if target_tokens == 0 {
            bail!("target_tokens must be greater than 0");
        }
        if overlap_tokens >= target_tokens {
            bail!(
                "overlap_tokens ({}) must be less than target_tokens ({})",
                overlap_tokens,
                target_tokens
            );
        }
        Ok(Self {
            target_tokens,
            overlap_tokens,
            ..Default::default()
        })
    }

    /// Builds the chunk configuration from the `[chunking]` section.
    pub fn from_config(config: &ChunkingConfig) -> Result<Self> {
        Ok(Self::new(config.target_tokens(), config.overlap_tokens())?
            .with_min_chars(config.min_chars()))
    }

    /// Sets the minimum document size.
    pub fn with_min_chars(mut self, min_chars: usize) -> Self {
        self.min_chars = min_chars;
        self
    }

    /// Window size in characters.
    pub fn window_chars(&self) -> usize {
        (self.target_tokens * CHARS_PER_TOKEN).max(1)
    }

    /// Distance between window starts in characters.
    pub fn step_chars(&self) -> usize {
        (self.target_tokens.saturating_sub(self.overlap_tokens) * CHARS_PER_TOKEN).max(1)
    }
}

/// One window of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    /// Position of the chunk within its document (0-indexed).
    pub index: usize,
    /// Character offset of the first character.
    pub start_char: usize,
    /// The chunk text content.
    pub text: String,
}

/// Splits text into overlapping chunks for embedding generation.
pub struct EmbeddingChunker {
    config: ChunkConfig,
}

impl EmbeddingChunker {
    /// Creates a new chunker with the given configuration.
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// Creates a chunker with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Checks if a document is too short to index.
    pub fn is_too_short(&self, content: &str) -> bool {
        content.chars().count() < self.config.min_chars
    }

    /// Splits text into overlapping chunks.
    ///
    /// Algorithm:
    /// ```text
    /// size = target_tokens * 4
    /// step = (target_tokens - overlap_tokens) * 4
    /// start = 0
    /// while start < total_chars:
    ///   chunk = chars[start..start + size]
    ///   start += step
    /// ```
    pub fn chunk_text(&self, content: &str) -> Vec<TextChunk> {
        if content.is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = content.chars().collect();
        let size = self.config.window_chars();
        let step = self.config.step_chars();

        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < chars.len() {
            let end = (start + size).min(chars.len());
            chunks.push(TextChunk {
                index: chunks.len(),
                start_char: start,
                text: chars[start..end].iter().collect(),
            });
            start += step;
        }
        chunks
    }

    /// Chunks a document, or returns nothing when it is below `min_chars`.
    pub fn chunk_document(&self, content: &str) -> Vec<TextChunk> {
        if self.is_too_short(content) {
            return Vec::new();
        }
        self.chunk_text(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChunkConfig::default();
        assert_eq!(config.target_tokens, 800);
        assert_eq!(config.overlap_tokens, 100);
        assert_eq!(config.window_chars(), 3200);
        assert_eq!(config.step_chars(), 2800);
    }

    #[test]
    fn test_config_validation() {
        assert!(ChunkConfig::new(800, 100).is_ok());

        // Invalid: overlap >= target
        assert!(ChunkConfig::new(20, 20).is_err());
        assert!(ChunkConfig::new(20, 30).is_err());

        // Invalid: zero target
        assert!(ChunkConfig::new(0, 0).is_err());
    }

    #[test]
    fn test_empty_content() {
        let chunker = EmbeddingChunker::with_defaults();
        assert!(chunker.chunk_text("").is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunker = EmbeddingChunker::new(ChunkConfig::new(5, 2).unwrap());
        let chunks = chunker.chunk_text("hello world");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn test_overlapping_windows() {
        // size = 8 chars, step = 4 chars
        let chunker = EmbeddingChunker::new(ChunkConfig::new(2, 1).unwrap());
        let chunks = chunker.chunk_text("abcdefghijkl");

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcdefgh", "efghijkl", "ijkl"]);
        assert_eq!(chunks[2].index, 2);
        assert_eq!(chunks[2].start_char, 8);
    }

    #[test]
    fn test_multibyte_text_split_on_chars() {
        let chunker = EmbeddingChunker::new(ChunkConfig::new(1, 0).unwrap());
        let chunks = chunker.chunk_text("ääääöö");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "ääää");
        assert_eq!(chunks[1].text, "öö");
    }

    #[test]
    fn test_short_documents_skipped() {
        let chunker = EmbeddingChunker::new(ChunkConfig::default().with_min_chars(10));
        assert!(chunker.chunk_document("too short").is_empty());
        assert_eq!(chunker.chunk_document("long enough text").len(), 1);
    }
}
