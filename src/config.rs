// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration file support for evidex
//!
//! Loads configuration from .evidexrc.toml in current directory or ~/.config/evidex/config.toml,
//! then applies `EVIDEX_*` environment overrides.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Embedding provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderType {
    /// Remote provider when a credential is available, otherwise offline
    #[default]
    Auto,
    /// OpenAI-compatible HTTP endpoint
    Http,
    /// External command speaking JSON over stdin/stdout
    Command,
    /// Deterministic offline generator
    Hash,
}

/// Embedding configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider type (auto, http, command, hash)
    pub provider: Option<EmbeddingProviderType>,
    /// Model identifier sent to the provider and used as cache key
    pub model: Option<String>,
    /// Target dimension of every produced vector
    pub dimension: Option<usize>,
    /// Base URL of the HTTP provider
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: Option<String>,
    /// Provider timeout in seconds
    pub timeout_secs: Option<u64>,
    /// Retries after the first failed attempt
    pub max_retries: Option<usize>,
    /// Minimum backoff between retries in milliseconds
    pub backoff_min_ms: Option<u64>,
    /// Maximum backoff between retries in milliseconds
    pub backoff_max_ms: Option<u64>,
    /// Texts per provider request
    pub batch_size: Option<usize>,
    /// Allow the offline generator when no credential is configured
    pub allow_offline: Option<bool>,
    /// Always use the offline generator
    pub force_offline: Option<bool>,
    /// Command to execute for command provider
    pub command: Option<String>,
}

impl EmbeddingConfig {
    /// Get provider type (defaults to Auto)
    pub fn provider(&self) -> EmbeddingProviderType {
        self.provider.unwrap_or_default()
    }

    /// Get model identifier (defaults to "text-embedding-3-small")
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("text-embedding-3-small")
    }

    /// Get target dimension (defaults to 1536)
    pub fn dimension(&self) -> usize {
        self.dimension.unwrap_or(1536)
    }

    /// Get base URL (defaults to the OpenAI API)
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
    }

    /// Get API key variable name (defaults to OPENAI_API_KEY)
    pub fn api_key_env(&self) -> &str {
        self.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY")
    }

    /// Read the API key from the configured variable, ignoring blank values
    pub fn api_key(&self) -> Option<String> {
        env::var(self.api_key_env())
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }

    /// Get provider timeout (defaults to 30s)
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(30))
    }

    /// Get max retries (defaults to 3, i.e. 4 attempts)
    pub fn max_retries(&self) -> usize {
        self.max_retries.unwrap_or(3)
    }

    /// Get minimum backoff (defaults to 500ms)
    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms.unwrap_or(500))
    }

    /// Get maximum backoff (defaults to 4000ms)
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms.unwrap_or(4000))
    }

    /// Get batch size (defaults to 64)
    pub fn batch_size(&self) -> usize {
        self.batch_size.filter(|&b| b > 0).unwrap_or(64)
    }

    /// Get allow_offline (defaults to true)
    pub fn allow_offline(&self) -> bool {
        self.allow_offline.unwrap_or(true)
    }

    /// Get force_offline (defaults to false)
    pub fn force_offline(&self) -> bool {
        self.force_offline.unwrap_or(false)
    }

    /// Get command (defaults to "embedder")
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or("embedder")
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Rolling window length in seconds
    pub window_secs: Option<u64>,
    /// Requests per window (0 disables)
    pub rpm: Option<u64>,
    /// Estimated tokens per window (0 disables)
    pub tpm: Option<u64>,
    /// Fraction of the limit at which throttling starts
    pub headroom: Option<f64>,
}

impl RateLimitConfig {
    /// Get window (defaults to 60s)
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.unwrap_or(60))
    }

    /// Get requests per window (defaults to 5000)
    pub fn rpm(&self) -> u64 {
        self.rpm.unwrap_or(5000)
    }

    /// Get tokens per window (defaults to 1,000,000)
    pub fn tpm(&self) -> u64 {
        self.tpm.unwrap_or(1_000_000)
    }

    /// Get headroom (defaults to 0.90, clamped to [0.1, 1.0])
    pub fn headroom(&self) -> f64 {
        self.headroom.unwrap_or(0.90).clamp(0.1, 1.0)
    }
}

/// Embedding cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: Option<bool>,
    /// Path of the SQLite cache (relative paths resolve against the index dir)
    pub path: Option<PathBuf>,
    /// Durable row ceiling
    pub max_rows: Option<u64>,
    /// Entries kept in the in-memory LRU
    pub hot_capacity: Option<usize>,
}

impl CacheConfig {
    /// Get enabled (defaults to true)
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Resolve the cache path against an index directory
    pub fn path(&self, index_dir: &Path) -> PathBuf {
        match &self.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => index_dir.join(p),
            None => index_dir.join("embed_cache.sqlite"),
        }
    }

    /// Get max rows (defaults to 5,000,000)
    pub fn max_rows(&self) -> u64 {
        self.max_rows.unwrap_or(5_000_000)
    }

    /// Get hot LRU capacity (defaults to 100,000)
    pub fn hot_capacity(&self) -> usize {
        self.hot_capacity.unwrap_or(100_000)
    }
}

/// Dimensionality reduction configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    /// Whether a projection matrix is built for the provider dimension
    pub enabled: Option<bool>,
    /// Provider output dimension the matrix reduces from
    pub input_dim: Option<usize>,
    /// Seed of the projection
    pub seed: Option<u64>,
    /// Directory holding cached matrices (defaults to the index dir)
    pub cache_dir: Option<PathBuf>,
}

impl ReductionConfig {
    /// Get enabled (defaults to true)
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Get input dimension (defaults to 3072)
    pub fn input_dim(&self) -> usize {
        self.input_dim.unwrap_or(3072)
    }

    /// Get seed (defaults to 0)
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(0)
    }

    /// Resolve the matrix cache directory
    pub fn cache_dir(&self, index_dir: &Path) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| index_dir.to_path_buf())
    }
}

/// Vector store configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store directory name inside the index dir
    pub dir: Option<String>,
}

impl StoreConfig {
    /// Resolve the store directory (defaults to `<index>/vectors`)
    pub fn dir(&self, index_dir: &Path) -> PathBuf {
        index_dir.join(self.dir.as_deref().unwrap_or("vectors"))
    }
}

/// Hybrid search configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HybridSearchConfig {
    /// Weight of the lexical channel (0.0-1.0)
    pub alpha: Option<f32>,
    /// Return lexical-only results when query embedding fails
    pub allow_fallback: Option<bool>,
}

impl HybridSearchConfig {
    /// Get alpha (defaults to 0.5, clamped to [0, 1])
    pub fn alpha(&self) -> f32 {
        self.alpha.unwrap_or(0.5).clamp(0.0, 1.0)
    }

    /// Get allow_fallback (defaults to false)
    pub fn allow_fallback(&self) -> bool {
        self.allow_fallback.unwrap_or(false)
    }
}

/// Chunking configuration for ingestion
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_tokens: Option<usize>,
    pub overlap_tokens: Option<usize>,
    pub min_chars: Option<usize>,
}

impl ChunkingConfig {
    /// Get target tokens (defaults to 800)
    pub fn target_tokens(&self) -> usize {
        self.target_tokens.unwrap_or(800)
    }

    /// Get overlap tokens (defaults to 100)
    pub fn overlap_tokens(&self) -> usize {
        self.overlap_tokens.unwrap_or(100)
    }

    /// Get min chars (defaults to 200)
    pub fn min_chars(&self) -> usize {
        self.min_chars.unwrap_or(200)
    }
}

/// Configuration loaded from .evidexrc.toml or ~/.config/evidex/config.toml
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of results to return
    pub max_results: Option<usize>,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub reduction: ReductionConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub hybrid: HybridSearchConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,
}

impl Config {
    /// Load configuration from files, then apply environment overrides
    ///
    /// Precedence (highest to lowest):
    /// 1. EVIDEX_* environment variables
    /// 2. .evidexrc.toml in current directory
    /// 3. ~/.config/evidex/config.toml
    pub fn load() -> Result<Self> {
        let mut config = Self::load_files();
        config.apply_env()?;
        Ok(config)
    }

    fn load_files() -> Self {
        if let Some(config) = Self::load_from_path(&PathBuf::from(".evidexrc.toml")) {
            return config;
        }

        if let Some(home) = dirs::home_dir() {
            let config_path = home.join(".config").join("evidex").join("config.toml");
            if let Some(config) = Self::load_from_path(&config_path) {
                return config;
            }
        }

        Self::default()
    }

    fn load_from_path(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration")
    }

    /// Apply `EVIDEX_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(model) = parse_string_env("EVIDEX_MODEL")? {
            self.embedding.model = Some(model);
        }
        if let Some(dim) = parse_env::<usize>("EVIDEX_EMBED_DIM")? {
            if dim == 0 {
                bail!("EVIDEX_EMBED_DIM must be greater than 0");
            }
            self.embedding.dimension = Some(dim);
        }
        if let Some(offline) = parse_bool_env("EVIDEX_OFFLINE")? {
            self.embedding.force_offline = Some(offline);
        }
        if let Some(rpm) = parse_env::<u64>("EVIDEX_RPM_LIMIT")? {
            self.rate_limit.rpm = Some(rpm);
        }
        if let Some(tpm) = parse_env::<u64>("EVIDEX_TPM_LIMIT")? {
            self.rate_limit.tpm = Some(tpm);
        }
        if let Some(headroom) = parse_env::<f64>("EVIDEX_HEADROOM")? {
            self.rate_limit.headroom = Some(headroom);
        }
        if let Some(alpha) = parse_env::<f32>("EVIDEX_ALPHA")? {
            self.hybrid.alpha = Some(alpha);
        }
        Ok(())
    }

    /// Merge CLI options with config (CLI wins)
    pub fn merge_max_results(&self, cli_value: Option<usize>) -> usize {
        cli_value.or(self.max_results).unwrap_or(10)
    }
}

fn parse_string_env(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(raw) => {
            let value = raw.trim();
            if value.is_empty() {
                Ok(None)
            } else {
                Ok(Some(value.to_string()))
            }
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", name)),
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match parse_string_env(name)? {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid {} value: {}", name, value)),
        None => Ok(None),
    }
}

fn parse_bool_env(name: &str) -> Result<Option<bool>> {
    match parse_string_env(name)? {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => bail!("Invalid {} value: {}", name, other),
        },
        None => Ok(None),
    }
}
