// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cached, rate-limited, retrying embedding client.
//!
//! [`EmbeddingClient::embed_texts`] always returns L2-normalized vectors of the
//! configured dimension. Texts are content-addressed by their blake3 digest;
//! cache hits skip the provider entirely, misses are batched through the rate
//! limiter and the retry policy, reconciled to the target dimension and
//! written back to the cache.

use backon::{BlockingRetryable, ExponentialBuilder};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::embedding::cache::{CacheEntry, CacheKey, EmbeddingCacheStore, SqliteEmbeddingCache};
use crate::embedding::provider::{build_provider, l2_normalize, EmbeddingProvider};
use crate::embedding::rate_limit::{estimate_tokens, Clock, RateLimiter, SystemClock};
use crate::embedding::reduction::Reducer;
use crate::errors::{Result, RetrievalError};

/// Hex blake3 digest of the raw text.
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Exponential backoff bounds for provider calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(4000),
        }
    }
}

pub struct EmbeddingClient {
    provider: Box<dyn EmbeddingProvider>,
    dimension: usize,
    batch_size: usize,
    cache: Option<Arc<dyn EmbeddingCacheStore>>,
    limiter: Option<RateLimiter>,
    reducer: Option<Reducer>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl EmbeddingClient {
    /// Client without cache, rate limit or reducer.
    pub fn new(provider: Box<dyn EmbeddingProvider>, dimension: usize) -> Self {
        Self {
            provider,
            dimension,
            batch_size: 64,
            cache: None,
            limiter: None,
            reducer: None,
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Assembles the client described by `config`, keeping cache files and
    /// projection matrices under `index_dir`.
    pub fn from_config(config: &Config, index_dir: &Path) -> Result<Self> {
        Self::from_config_with_dim(config, index_dir, config.embedding.dimension())
    }

    /// Like [`EmbeddingClient::from_config`], but targets `dimension` instead
    /// of the configured one. Query paths pass the store's
    /// [`effective_dim`](crate::store::VectorStore::effective_dim) here.
    pub fn from_config_with_dim(config: &Config, index_dir: &Path, dimension: usize) -> Result<Self> {
        let mut embedding = config.embedding.clone();
        embedding.dimension = Some(dimension);
        let provider = build_provider(&embedding)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut client = Self::new(provider, dimension)
            .with_batch_size(embedding.batch_size())
            .with_retry(RetryPolicy {
                max_retries: embedding.max_retries(),
                min_delay: embedding.backoff_min(),
                max_delay: embedding.backoff_max(),
            })
            .with_clock(clock.clone())
            .with_rate_limiter(RateLimiter::from_config(&config.rate_limit, clock));

        if config.cache.enabled() {
            let path = config.cache.path(index_dir);
            match SqliteEmbeddingCache::open(
                &path,
                config.cache.max_rows(),
                config.cache.hot_capacity(),
            ) {
                Ok(cache) => client = client.with_cache(Arc::new(cache)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "embedding cache unavailable");
                }
            }
        }

        let input_dim = config.reduction.input_dim();
        if config.reduction.enabled() && input_dim > dimension {
            let reducer = Reducer::load_or_generate(
                config.reduction.cache_dir(index_dir),
                input_dim,
                dimension,
                config.reduction.seed(),
            )?;
            client = client.with_reducer(reducer);
        }

        Ok(client)
    }

    pub fn with_cache(mut self, cache: Arc<dyn EmbeddingCacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Clock used for backoff sleeps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_texts(&[text.to_string()])?;
        vectors
            .pop()
            .ok_or_else(|| RetrievalError::permanent("No embedding returned"))
    }

    /// Embeds `texts`, returning one unit vector of the target dimension per
    /// input, in input order.
    ///
    /// Remote providers go through the cache, so repeating a text issues no
    /// further provider calls. Local providers ([`EmbeddingProvider::is_local`],
    /// e.g. the offline hash generator) are called directly on every request;
    /// they skip the cache, rate limiter and retry.
    pub fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if self.provider.is_local() {
            let mut out = Vec::with_capacity(texts.len());
            for batch in texts.chunks(self.batch_size) {
                let raw = self.provider.embed_texts(batch)?;
                out.extend(self.reconcile_batch(raw, batch.len())?);
            }
            return Ok(out);
        }

        let model = self.provider.model_id().to_string();
        let keys: Vec<CacheKey> = texts
            .iter()
            .map(|t| CacheKey::new(content_hash(t), model.clone()))
            .collect();

        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        self.fill_from_cache(&keys, &mut results);

        // Identical texts share one provider slot.
        let mut pending: Vec<usize> = Vec::new();
        let mut slots: HashMap<&CacheKey, Vec<usize>> = HashMap::new();
        for (i, key) in keys.iter().enumerate() {
            if results[i].is_some() {
                continue;
            }
            let entry = slots.entry(key).or_default();
            if entry.is_empty() {
                pending.push(i);
            }
            entry.push(i);
        }

        if !pending.is_empty() {
            tracing::debug!(
                total = texts.len(),
                misses = pending.len(),
                model = %model,
                "embedding cache misses"
            );
        }

        for batch_ix in pending.chunks(self.batch_size) {
            let batch: Vec<String> = batch_ix.iter().map(|&i| texts[i].clone()).collect();
            let raw = self.call_provider(&batch)?;
            let vectors = self.reconcile_batch(raw, batch.len())?;

            let mut entries = Vec::with_capacity(batch.len());
            for (&first, vector) in batch_ix.iter().zip(vectors) {
                let key = &keys[first];
                if let Some(indices) = slots.get(key) {
                    for &i in indices {
                        results[i] = Some(vector.clone());
                    }
                }
                entries.push(CacheEntry {
                    key: key.clone(),
                    dim: self.dimension,
                    vector,
                });
            }
            self.write_back(&entries);
        }

        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RetrievalError::permanent("embedding missing for input"))
    }

    fn fill_from_cache(&self, keys: &[CacheKey], results: &mut [Option<Vec<f32>>]) {
        let Some(cache) = &self.cache else {
            return;
        };
        match cache.get_many(keys) {
            Ok(hits) => {
                for (slot, key) in results.iter_mut().zip(keys) {
                    if let Some(hit) = hits.get(key) {
                        if hit.dim == self.dimension && hit.vector.len() == self.dimension {
                            *slot = Some(hit.vector.clone());
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "embedding cache lookup failed; treating as misses");
            }
        }
    }

    fn write_back(&self, entries: &[CacheEntry]) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.put_many(entries) {
                tracing::warn!(error = %err, count = entries.len(), "embedding cache write failed");
            }
        }
    }

    /// One provider batch through the rate limiter and the retry policy.
    fn call_provider(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let tokens: u64 = batch.iter().map(|t| estimate_tokens(t)).sum();
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry.min_delay)
            .with_max_delay(self.retry.max_delay)
            .with_max_times(self.retry.max_retries);
        let clock = self.clock.clone();

        (|| {
            if let Some(limiter) = &self.limiter {
                limiter.acquire(tokens);
            }
            self.provider.embed_texts(batch)
        })
        .retry(backoff)
        .sleep(move |delay: Duration| clock.sleep(delay))
        .when(|err: &RetrievalError| err.is_retryable())
        .notify(|err: &RetrievalError, delay: Duration| {
            tracing::warn!(
                error = %err,
                delay_ms = delay.as_millis() as u64,
                "embedding request failed, retrying"
            );
        })
        .call()
    }

    fn reconcile_batch(&self, raw: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>> {
        if raw.len() != expected {
            return Err(RetrievalError::permanent(format!(
                "provider returned {} embeddings for {} inputs",
                raw.len(),
                expected
            )));
        }

        let mut truncated = 0usize;
        let mut out = Vec::with_capacity(raw.len());
        for vector in raw {
            let (vector, was_truncated) = self.reconcile(vector)?;
            if was_truncated {
                truncated += 1;
            }
            out.push(vector);
        }
        if truncated > 0 {
            tracing::warn!(
                count = truncated,
                target = self.dimension,
                "no reducer for provider dimension; truncating embeddings"
            );
        }
        Ok(out)
    }

    /// Brings `vector` to the target dimension and unit length.
    fn reconcile(&self, vector: Vec<f32>) -> Result<(Vec<f32>, bool)> {
        let target = self.dimension;
        let actual = vector.len();
        let mut truncated = false;

        let mut vector = if actual > target {
            match &self.reducer {
                Some(reducer) if reducer.handles(actual, target) => reducer.reduce(&vector)?,
                _ => {
                    truncated = true;
                    let mut v = vector;
                    v.truncate(target);
                    v
                }
            }
        } else if actual < target {
            let mut v = vector;
            v.resize(target, 0.0);
            v
        } else {
            vector
        };

        l2_normalize(&mut vector);
        Ok((vector, truncated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::provider::HashProvider;
    use crate::embedding::rate_limit::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider returning `[len, 1, 1, ...]` and failing its first calls.
    struct CountingProvider {
        calls: Arc<AtomicUsize>,
        texts: Arc<AtomicUsize>,
        dim: usize,
        failures: usize,
        retryable: bool,
    }

    impl CountingProvider {
        fn new(dim: usize) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let texts = Arc::new(AtomicUsize::new(0));
            let provider = Self {
                calls: calls.clone(),
                texts: texts.clone(),
                dim,
                failures: 0,
                retryable: true,
            };
            (provider, calls, texts)
        }

        fn failing(mut self, failures: usize, retryable: bool) -> Self {
            self.failures = failures;
            self.retryable = retryable;
            self
        }
    }

    impl EmbeddingProvider for CountingProvider {
        fn model_id(&self) -> &str {
            "counting"
        }

        fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.retryable {
                    RetrievalError::transient("HTTP status 503")
                } else {
                    RetrievalError::permanent("HTTP status 400")
                });
            }
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![1.0; self.dim];
                    v[0] = t.len() as f32;
                    v
                })
                .collect())
        }
    }

    fn fast_retry(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_second_call_served_from_cache() {
        let (provider, calls, _) = CountingProvider::new(4);
        let cache = Arc::new(SqliteEmbeddingCache::in_memory(1000, 100).unwrap());
        let client = EmbeddingClient::new(Box::new(provider), 4).with_cache(cache.clone());

        let texts = strings(&["alpha", "beta"]);
        let first = client.embed_texts(&texts).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.count().unwrap(), 2);

        let second = client.embed_texts(&texts).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_texts_embedded_once() {
        let (provider, _, sent) = CountingProvider::new(4);
        let client = EmbeddingClient::new(Box::new(provider), 4)
            .with_cache(Arc::new(SqliteEmbeddingCache::in_memory(1000, 100).unwrap()));

        let vectors = client
            .embed_texts(&strings(&["same", "other", "same"]))
            .unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 2);
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[2]);
    }

    #[test]
    fn test_cache_hit_with_other_dimension_is_a_miss() {
        let (provider, calls, _) = CountingProvider::new(4);
        let cache = Arc::new(SqliteEmbeddingCache::in_memory(1000, 100).unwrap());
        cache
            .put_many(&[CacheEntry {
                key: CacheKey::new(content_hash("alpha"), "counting"),
                dim: 2,
                vector: vec![1.0, 0.0],
            }])
            .unwrap();

        let client = EmbeddingClient::new(Box::new(provider), 4).with_cache(cache);
        let vector = client.embed_one("alpha").unwrap();
        assert_eq!(vector.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_smaller_provider_vectors_are_zero_padded() {
        let (provider, _, _) = CountingProvider::new(3);
        let client = EmbeddingClient::new(Box::new(provider), 5);

        let v = client.embed_one("ab").unwrap();
        assert_eq!(v.len(), 5);
        assert_eq!(&v[3..], &[0.0, 0.0]);
        assert!((norm(&v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_larger_provider_vectors_truncated_without_reducer() {
        let (provider, _, _) = CountingProvider::new(6);
        let client = EmbeddingClient::new(Box::new(provider), 4);

        // raw [3,1,1,1,1,1] -> [3,1,1,1] / sqrt(12)
        let v = client.embed_one("abc").unwrap();
        let expected = 12f32.sqrt();
        assert_eq!(v.len(), 4);
        assert!((v[0] - 3.0 / expected).abs() < 1e-6);
        assert!((v[3] - 1.0 / expected).abs() < 1e-6);
    }

    #[test]
    fn test_larger_provider_vectors_reduced_with_matching_reducer() {
        let (provider, _, _) = CountingProvider::new(6);
        let reducer = Reducer::generate(6, 4, 11).unwrap();
        let mut expected = reducer.reduce(&[3.0, 1.0, 1.0, 1.0, 1.0, 1.0]).unwrap();
        l2_normalize(&mut expected);

        let client = EmbeddingClient::new(Box::new(provider), 4).with_reducer(reducer);
        let v = client.embed_one("abc").unwrap();
        assert_eq!(v, expected);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let (provider, calls, _) = CountingProvider::new(4);
        let clock = Arc::new(ManualClock::new());
        let client = EmbeddingClient::new(Box::new(provider.failing(2, true)), 4)
            .with_retry(fast_retry(3))
            .with_clock(clock.clone());

        let v = client.embed_one("retry me").unwrap();
        assert_eq!(v.len(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[test]
    fn test_exhausted_retries_surface_error() {
        let (provider, calls, _) = CountingProvider::new(4);
        let clock = Arc::new(ManualClock::new());
        let client = EmbeddingClient::new(Box::new(provider.failing(usize::MAX, true)), 4)
            .with_retry(fast_retry(2))
            .with_clock(clock);

        let err = client.embed_one("never").unwrap_err();
        assert!(matches!(err, RetrievalError::Provider { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let (provider, calls, _) = CountingProvider::new(4);
        let clock = Arc::new(ManualClock::new());
        let client = EmbeddingClient::new(Box::new(provider.failing(1, false)), 4)
            .with_retry(fast_retry(3))
            .with_clock(clock.clone());

        assert!(client.embed_one("bad request").is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_requests_accounted_against_rate_budget() {
        let (provider, _, _) = CountingProvider::new(4);
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(100, 10_000, 1.0, Duration::from_secs(60), clock.clone());
        let client = EmbeddingClient::new(Box::new(provider), 4)
            .with_batch_size(1)
            .with_rate_limiter(limiter);

        client
            .embed_texts(&strings(&["12345678", "1234"]))
            .unwrap();
        let budget = client.limiter.as_ref().unwrap().snapshot();
        assert_eq!(budget.requests, 2);
        assert_eq!(budget.tokens, 3);
    }

    #[test]
    fn test_offline_provider_is_deterministic_and_uncached() {
        let cache = Arc::new(SqliteEmbeddingCache::in_memory(1000, 100).unwrap());
        let client =
            EmbeddingClient::new(Box::new(HashProvider::new(8)), 8).with_cache(cache.clone());

        let a = client.embed_one("offline text").unwrap();
        let b = client.embed_one("offline text").unwrap();
        assert_eq!(a, b);
        assert!((norm(&a) - 1.0).abs() < 1e-5);
        assert_eq!(cache.count().unwrap(), 0);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("x"), content_hash("x"));
        assert_ne!(content_hash("x"), content_hash("y"));
        assert_eq!(content_hash("x").len(), 64);
    }

    #[test]
    fn test_from_config_with_dim_overrides_configured_dimension() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_toml(
            "[embedding]\nprovider = \"hash\"\ndimension = 16\n\n[reduction]\nenabled = false\n",
        )
        .unwrap();

        let client = EmbeddingClient::from_config_with_dim(&config, dir.path(), 8).unwrap();
        assert_eq!(client.dimension(), 8);
        assert_eq!(client.embed_one("rolling deploys").unwrap().len(), 8);

        let default = EmbeddingClient::from_config(&config, dir.path()).unwrap();
        assert_eq!(default.dimension(), 16);
    }
}
