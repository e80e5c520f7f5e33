// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider interface and implementations.
//!
//! Providers turn a batch of texts into raw vectors, one per input and in
//! input order. Dimension reconciliation, caching, rate limiting and retries
//! are layered on top by [`crate::embedding::EmbeddingClient`].

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingProviderType};
use crate::embedding::reduction::standard_normal_pair;
use crate::errors::{Result, RetrievalError};

/// Trait for embedding providers.
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier.
    fn model_id(&self) -> &str;

    /// Generates embeddings for the given texts.
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Local providers are cheap and deterministic: no cache, budget or retry.
    fn is_local(&self) -> bool {
        false
    }

    /// Generates an embedding for a single text.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.embed_texts(&[text.to_string()])?;
        result
            .pop()
            .ok_or_else(|| RetrievalError::permanent("No embedding returned"))
    }
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct HttpProvider {
    agent: ureq::Agent,
    url: String,
    api_key: String,
    model: String,
}

impl HttpProvider {
    pub fn new(base_url: &str, api_key: String, model: String, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        let agent = ureq::Agent::new_with_config(config);

        Self {
            agent,
            url: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key,
            model,
        }
    }

    fn post(&self, texts: &[String]) -> Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let body = serde_json::to_vec(&payload)
            .map_err(|e| RetrievalError::permanent(format!("failed to serialize request: {}", e)))?;

        let mut response = self
            .agent
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Authorization", &format!("Bearer {}", self.api_key))
            .send(&body[..])
            .map_err(classify_transport_error)?;

        response
            .body_mut()
            .read_to_string()
            .map_err(|e| RetrievalError::transient(format!("failed to read response: {}", e)))
    }
}

/// Maps a ureq failure to retryable or permanent.
fn classify_transport_error(err: ureq::Error) -> RetrievalError {
    match err {
        ureq::Error::StatusCode(status) => {
            let message = format!("HTTP status {}", status);
            if is_retryable_status(status) {
                RetrievalError::transient(message)
            } else {
                RetrievalError::permanent(message)
            }
        }
        other => RetrievalError::transient(other.to_string()),
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl EmbeddingProvider for HttpProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let text = self.post(texts)?;
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| RetrievalError::permanent(format!("invalid JSON response: {}", e)))?;
        parse_openai_response(&parsed, texts.len())
    }
}

/// Extracts `data[].embedding`, ordered by `index` when present.
fn parse_openai_response(parsed: &Value, expected: usize) -> Result<Vec<Vec<f32>>> {
    let data = parsed
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RetrievalError::permanent("response missing 'data' array"))?;

    let mut rows: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| RetrievalError::permanent("response item missing 'embedding'"))?;
        rows.push((index, parse_vector(embedding)?));
    }
    rows.sort_by_key(|(index, _)| *index);

    if rows.len() != expected {
        return Err(RetrievalError::permanent(format!(
            "provider returned {} embeddings for {} inputs",
            rows.len(),
            expected
        )));
    }
    Ok(rows.into_iter().map(|(_, v)| v).collect())
}

fn parse_vector(value: &Value) -> Result<Vec<f32>> {
    value
        .as_array()
        .ok_or_else(|| RetrievalError::permanent("Embedding row must be an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RetrievalError::permanent("Embedding value must be a number"))
        })
        .collect()
}

/// Command provider that shells out to an external process.
pub struct CommandProvider {
    command: String,
    model: String,
}

impl CommandProvider {
    pub fn new(command: String, model: String) -> Self {
        Self { command, model }
    }

    fn run_command(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let payload = serde_json::json!({
            "model": self.model,
            "texts": texts,
        });

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                RetrievalError::Configuration(format!(
                    "Failed to spawn embedding command '{}': {}",
                    self.command, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.to_string().as_bytes())
                .map_err(|e| RetrievalError::transient(format!("Failed to write payload: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| RetrievalError::transient(format!("Failed to read command output: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RetrievalError::transient(format!(
                "Embedding command failed (status {}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: Value = serde_json::from_str(stdout.trim()).map_err(|e| {
            RetrievalError::permanent(format!("Failed to parse command output as JSON: {}", e))
        })?;

        let embeddings_value = match parsed {
            Value::Array(arr) => Value::Array(arr),
            Value::Object(ref obj) => obj
                .get("embeddings")
                .or_else(|| obj.get("vectors"))
                .or_else(|| obj.get("data"))
                .cloned()
                .ok_or_else(|| {
                    RetrievalError::permanent("Command output missing 'embeddings' field")
                })?,
            _ => {
                return Err(RetrievalError::permanent(
                    "Command output must be JSON array or object",
                ))
            }
        };

        embeddings_value
            .as_array()
            .ok_or_else(|| RetrievalError::permanent("Embeddings output must be a JSON array"))?
            .iter()
            .map(parse_vector)
            .collect()
    }
}

impl EmbeddingProvider for CommandProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.run_command(texts)
    }
}

/// Offline generator: the same text always yields the same unit vector.
pub struct HashProvider {
    model: String,
    dimension: usize,
}

impl HashProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            model: "offline-hash".to_string(),
            dimension,
        }
    }

    /// Derives a unit vector from the blake3 digest of `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = blake3::hash(text.as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(digest.as_bytes());
        let mut rng = StdRng::from_seed(seed);

        let mut vector = Vec::with_capacity(self.dimension);
        while vector.len() < self.dimension {
            let (z0, z1) = standard_normal_pair(&mut rng);
            vector.push(z0 as f32);
            if vector.len() < self.dimension {
                vector.push(z1 as f32);
            }
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl EmbeddingProvider for HashProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Selects a provider for the configuration.
///
/// `auto` uses the HTTP provider when an API key is present and offline mode
/// is not forced, falling back to the offline generator only when allowed.
pub fn build_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    let model = config.model().to_string();

    if config.force_offline() {
        return Ok(Box::new(HashProvider::new(config.dimension())));
    }

    match config.provider() {
        EmbeddingProviderType::Hash => Ok(Box::new(HashProvider::new(config.dimension()))),
        EmbeddingProviderType::Command => Ok(Box::new(CommandProvider::new(
            config.command().to_string(),
            model,
        ))),
        EmbeddingProviderType::Http => {
            let api_key = config.api_key().ok_or_else(|| {
                RetrievalError::Configuration(format!(
                    "no API key in {} for the http embedding provider",
                    config.api_key_env()
                ))
            })?;
            Ok(Box::new(HttpProvider::new(
                config.base_url(),
                api_key,
                model,
                config.timeout(),
            )))
        }
        EmbeddingProviderType::Auto => match config.api_key() {
            Some(api_key) => Ok(Box::new(HttpProvider::new(
                config.base_url(),
                api_key,
                model,
                config.timeout(),
            ))),
            None if config.allow_offline() => {
                tracing::info!(
                    "no API key in {}; using offline embeddings",
                    config.api_key_env()
                );
                Ok(Box::new(HashProvider::new(config.dimension())))
            }
            None => Err(RetrievalError::Configuration(format!(
                "no API key in {} and offline embeddings are disabled",
                config.api_key_env()
            ))),
        },
    }
}

/// Scales `vector` to unit length; a zero vector is left unchanged.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_provider_is_deterministic() {
        let provider = HashProvider::new(64);
        assert_eq!(provider.model_id(), "offline-hash");
        assert!(provider.is_local());

        let a = provider.embed_one("hello").unwrap();
        let b = provider.embed_one("hello").unwrap();
        let c = provider.embed_one("world").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_embed() {
        let provider = HashProvider::new(8);
        assert!(provider.embed_texts(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let body = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_response_count_mismatch() {
        let body = serde_json::json!({"data": [{"embedding": [1.0]}]});
        let err = parse_openai_response(&body, 2).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(408));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }

    #[test]
    fn test_command_provider_parses_object_output() {
        let provider = CommandProvider::new(
            r#"cat > /dev/null; echo '{"embeddings": [[0.5, 0.5], [1, 0]]}'"#.to_string(),
            "cmd-model".to_string(),
        );
        let vectors = provider
            .embed_texts(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(vectors, vec![vec![0.5, 0.5], vec![1.0, 0.0]]);
    }

    #[test]
    fn test_command_provider_failure_is_retryable() {
        let provider = CommandProvider::new("exit 3".to_string(), "m".to_string());
        let err = provider.embed_texts(&["a".to_string()]).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_build_provider_forced_offline() {
        let config = EmbeddingConfig {
            force_offline: Some(true),
            dimension: Some(16),
            ..Default::default()
        };
        let provider = build_provider(&config).unwrap();
        assert!(provider.is_local());
        assert_eq!(provider.embed_one("x").unwrap().len(), 16);
    }

    #[test]
    fn test_build_provider_requires_credential_without_offline() {
        let config = EmbeddingConfig {
            provider: Some(EmbeddingProviderType::Auto),
            api_key_env: Some("EVIDEX_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
            allow_offline: Some(false),
            ..Default::default()
        };
        let err = build_provider(&config).err().unwrap();
        assert!(matches!(err, RetrievalError::Configuration(_)));
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
