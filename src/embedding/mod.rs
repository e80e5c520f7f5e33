// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding module - turns text into unit vectors of a fixed dimension
//!
//! The [`EmbeddingClient`] composes a provider with the durable embedding
//! cache, the rolling-window rate limiter, retry with backoff and the
//! deterministic random-projection reducer.

pub mod cache;
pub mod chunker;
pub mod client;
pub mod provider;
pub mod rate_limit;
pub mod reduction;

pub use cache::{CacheEntry, CacheKey, CachedVector, EmbeddingCacheStore, SqliteEmbeddingCache};
pub use chunker::{ChunkConfig, EmbeddingChunker, TextChunk};
pub use client::{content_hash, EmbeddingClient, RetryPolicy};
pub use provider::{
    build_provider, l2_normalize, CommandProvider, EmbeddingProvider, HashProvider, HttpProvider,
};
pub use rate_limit::{estimate_tokens, Clock, RateBudget, RateLimiter, SystemClock};
pub use reduction::Reducer;
