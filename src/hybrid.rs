// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hybrid search combining BM25 and embedding-based similarity.
//!
//! The lexical and vector channels run side by side for the same query. Each
//! channel's scores are min-max normalized over its own result set, then
//! merged by id as `alpha * lexical + (1 - alpha) * vector`, where a channel
//! that did not return an id contributes `0`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::HybridSearchConfig;
use crate::embedding::EmbeddingClient;
use crate::errors::Result;
use crate::lexical::{LexicalHit, LexicalSearch};
use crate::store::{Metadata, SearchFilters, VectorHit, VectorStore, OVERFETCH_FACTOR};

/// Search mode for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// BM25 keyword search only
    Keyword,
    /// Embedding-based semantic search only
    Semantic,
    /// Combined BM25 + embedding search
    #[default]
    Hybrid,
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchMode::Keyword => write!(f, "keyword"),
            SearchMode::Semantic => write!(f, "semantic"),
            SearchMode::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyword" | "k" => Ok(SearchMode::Keyword),
            "semantic" | "s" => Ok(SearchMode::Semantic),
            "hybrid" | "h" => Ok(SearchMode::Hybrid),
            _ => Err(format!("Unknown search mode: {}", s)),
        }
    }
}

/// Configuration for hybrid search
#[derive(Debug, Clone)]
pub struct HybridConfig {
    /// Weight of the lexical channel (0.0-1.0)
    pub alpha: f32,
    /// Return lexical-only results when the query cannot be embedded
    pub allow_fallback: bool,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            allow_fallback: false,
        }
    }
}

impl HybridConfig {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            ..Default::default()
        }
    }

    pub fn from_config(config: &HybridSearchConfig) -> Self {
        Self {
            alpha: config.alpha(),
            allow_fallback: config.allow_fallback(),
        }
    }

    pub fn with_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }
}

/// A fused search result with both channels' scores
#[derive(Debug, Clone, Serialize)]
pub struct FusedHit {
    pub id: String,
    /// Final combined score (0.0-1.0 in hybrid mode)
    pub score: f32,
    /// Raw lexical score, when the lexical channel returned this id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f32>,
    /// Raw cosine similarity, when the vector channel returned this id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    pub lexical_norm: f32,
    pub vector_norm: f32,
    /// Stored fields from both channels (vector metadata wins on conflict)
    pub fields: Metadata,
}

/// Min-max normalization into `[0, 1]`.
///
/// One item or all-equal scores normalize to `0.0`.
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }
    let lo = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let hi = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if hi <= lo {
        return vec![0.0; scores.len()];
    }
    scores.iter().map(|s| (s - lo) / (hi - lo)).collect()
}

/// Keeps the first (best) hit per id.
fn dedup_by_id<T>(hits: Vec<T>, id: impl Fn(&T) -> &str) -> Vec<T> {
    let mut seen = std::collections::HashSet::new();
    hits.into_iter()
        .filter(|hit| seen.insert(id(hit).to_string()))
        .collect()
}

/// Merges lexical and vector results into the top `k` ids by fused score.
pub fn fuse(
    lexical: Vec<LexicalHit>,
    vector: Vec<VectorHit>,
    alpha: f32,
    k: usize,
) -> Vec<FusedHit> {
    let alpha = alpha.clamp(0.0, 1.0);
    let lexical = dedup_by_id(lexical, |h| h.id.as_str());
    let vector = dedup_by_id(vector, |h| h.id.as_str());

    let lexical_norms = min_max_normalize(&lexical.iter().map(|h| h.score).collect::<Vec<_>>());
    let vector_norms = min_max_normalize(&vector.iter().map(|h| h.score).collect::<Vec<_>>());

    let mut by_id: HashMap<String, FusedHit> = HashMap::new();
    for (hit, norm) in lexical.into_iter().zip(lexical_norms) {
        by_id.insert(
            hit.id.clone(),
            FusedHit {
                id: hit.id,
                score: 0.0,
                lexical_score: Some(hit.score),
                vector_score: None,
                lexical_norm: norm,
                vector_norm: 0.0,
                fields: hit.fields,
            },
        );
    }
    for (hit, norm) in vector.into_iter().zip(vector_norms) {
        let entry = by_id.entry(hit.id.clone()).or_insert_with(|| FusedHit {
            id: hit.id.clone(),
            score: 0.0,
            lexical_score: None,
            vector_score: None,
            lexical_norm: 0.0,
            vector_norm: 0.0,
            fields: Metadata::new(),
        });
        entry.vector_score = Some(hit.score);
        entry.vector_norm = norm;
        entry.fields.extend(hit.metadata);
    }

    let mut fused: Vec<FusedHit> = by_id
        .into_values()
        .map(|mut hit| {
            hit.score = alpha * hit.lexical_norm + (1.0 - alpha) * hit.vector_norm;
            hit
        })
        .collect();

    fused.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    fused.truncate(k);
    fused
}

/// Results of one query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub mode: SearchMode,
    pub hits: Vec<FusedHit>,
    /// The vector channel failed and only lexical results are returned
    pub fallback: bool,
}

/// Runs semantic, keyword or hybrid queries over the configured channels.
pub struct HybridSearcher<'a> {
    client: &'a EmbeddingClient,
    store: &'a VectorStore,
    lexical: Option<&'a dyn LexicalSearch>,
    config: HybridConfig,
}

impl<'a> HybridSearcher<'a> {
    pub fn new(
        client: &'a EmbeddingClient,
        store: &'a VectorStore,
        lexical: Option<&'a dyn LexicalSearch>,
        config: HybridConfig,
    ) -> Self {
        Self {
            client,
            store,
            lexical,
            config,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    pub fn search(
        &self,
        mode: SearchMode,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<SearchOutcome> {
        let (hits, fallback) = match mode {
            SearchMode::Semantic => (self.semantic(query, k, filters)?, false),
            SearchMode::Keyword => (self.keyword(query, k, filters)?, false),
            SearchMode::Hybrid => self.hybrid(query, k, filters)?,
        };
        Ok(SearchOutcome {
            mode,
            hits,
            fallback,
        })
    }

    /// Vector channel only; scores are raw cosine similarities.
    pub fn semantic(&self, query: &str, k: usize, filters: &SearchFilters) -> Result<Vec<FusedHit>> {
        let hits = self.vector_hits(query, k, filters)?;
        Ok(hits
            .into_iter()
            .map(|hit| FusedHit {
                id: hit.id,
                score: hit.score,
                lexical_score: None,
                vector_score: Some(hit.score),
                lexical_norm: 0.0,
                vector_norm: 0.0,
                fields: hit.metadata,
            })
            .collect())
    }

    /// Lexical channel only; scores are raw BM25 scores.
    pub fn keyword(&self, query: &str, k: usize, filters: &SearchFilters) -> Result<Vec<FusedHit>> {
        Ok(self
            .lexical_hits(query, k, filters)?
            .into_iter()
            .map(|hit| FusedHit {
                id: hit.id,
                score: hit.score,
                lexical_score: Some(hit.score),
                vector_score: None,
                lexical_norm: 0.0,
                vector_norm: 0.0,
                fields: hit.fields,
            })
            .collect())
    }

    /// Both channels in parallel, fused. Returns the hits and whether the
    /// vector channel was dropped.
    pub fn hybrid(
        &self,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<(Vec<FusedHit>, bool)> {
        let (lexical, embedded) = rayon::join(
            || self.lexical_hits(query, k, filters),
            || self.client.embed_one(query),
        );
        let lexical = lexical?;

        let (vector, fallback) = match embedded {
            Ok(query_vector) => (self.store.search(&query_vector, k, filters)?, false),
            Err(err) if self.config.allow_fallback => {
                tracing::warn!(error = %err, "query embedding failed; returning lexical results only");
                (Vec::new(), true)
            }
            Err(err) => return Err(err),
        };

        tracing::debug!(
            lexical = lexical.len(),
            vector = vector.len(),
            alpha = self.config.alpha,
            "fusing hybrid results"
        );
        Ok((fuse(lexical, vector, self.config.alpha, k), fallback))
    }

    fn vector_hits(&self, query: &str, k: usize, filters: &SearchFilters) -> Result<Vec<VectorHit>> {
        let query_vector = self.client.embed_one(query)?;
        self.store.search(&query_vector, k, filters)
    }

    fn lexical_hits(
        &self,
        query: &str,
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<LexicalHit>> {
        let Some(lexical) = self.lexical else {
            return Ok(Vec::new());
        };
        if filters.is_empty() {
            return lexical.search(query, k);
        }
        let mut hits = lexical.search(query, k.saturating_mul(OVERFETCH_FACTOR))?;
        hits.retain(|hit| filters.matches(&hit.fields));
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, HashProvider};
    use crate::errors::RetrievalError;
    use crate::store::VectorRecord;
    use serde_json::Value;
    use tempfile::TempDir;

    fn lex(id: &str, score: f32) -> LexicalHit {
        let mut fields = Metadata::new();
        fields.insert("title".into(), Value::String(format!("title {}", id)));
        fields.insert("space".into(), Value::String("ENG".into()));
        LexicalHit {
            id: id.to_string(),
            score,
            fields,
        }
    }

    fn vec_hit(id: &str, score: f32) -> VectorHit {
        let mut metadata = Metadata::new();
        metadata.insert("id".into(), Value::String(id.into()));
        VectorHit {
            id: id.to_string(),
            score,
            metadata,
        }
    }

    fn order(hits: &[FusedHit]) -> Vec<&str> {
        hits.iter().map(|h| h.id.as_str()).collect()
    }

    #[test]
    fn test_search_mode_parse() {
        assert_eq!("keyword".parse::<SearchMode>().unwrap(), SearchMode::Keyword);
        assert_eq!("s".parse::<SearchMode>().unwrap(), SearchMode::Semantic);
        assert_eq!("HYBRID".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::default(), SearchMode::Hybrid);
    }

    #[test]
    fn test_min_max_normalize() {
        assert!(min_max_normalize(&[]).is_empty());
        assert_eq!(min_max_normalize(&[3.0]), vec![0.0]);
        assert_eq!(min_max_normalize(&[2.0, 2.0]), vec![0.0, 0.0]);
        assert_eq!(min_max_normalize(&[10.0, 5.0, 0.0]), vec![1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_id_in_both_channels_ranks_first() {
        let fused = fuse(
            vec![lex("A", 10.0), lex("B", 8.0), lex("D", 0.0)],
            vec![vec_hit("C", 0.9), vec_hit("B", 0.8), vec_hit("E", 0.1)],
            0.5,
            10,
        );

        assert_eq!(order(&fused), vec!["B", "A", "C", "D", "E"]);
        let b = &fused[0];
        assert!((b.score - 0.8375).abs() < 1e-5);
        assert_eq!(b.lexical_score, Some(8.0));
        assert_eq!(b.vector_score, Some(0.8));
        assert_eq!(b.fields["title"], "title B");
        assert_eq!(b.fields["id"], "B");
        assert!((fused[1].score - 0.5).abs() < 1e-6);
        assert!((fused[2].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_single_item_channels_normalize_to_zero() {
        let fused = fuse(vec![lex("A", 10.0)], vec![vec_hit("B", 0.9)], 0.5, 10);
        assert!(fused.iter().all(|h| h.score == 0.0));
        // Equal scores fall back to id order.
        assert_eq!(order(&fused), vec!["A", "B"]);
    }

    #[test]
    fn test_alpha_weights_channels() {
        let lexical = vec![lex("A", 10.0), lex("B", 0.0)];
        let vector = vec![vec_hit("B", 0.9), vec_hit("A", 0.1)];

        let lexical_only = fuse(lexical.clone(), vector.clone(), 1.0, 10);
        assert_eq!(order(&lexical_only), vec!["A", "B"]);

        let vector_only = fuse(lexical, vector, 0.0, 10);
        assert_eq!(order(&vector_only), vec!["B", "A"]);
    }

    #[test]
    fn test_duplicate_chunk_ids_keep_best() {
        let fused = fuse(
            Vec::new(),
            vec![vec_hit("A", 0.9), vec_hit("B", 0.5), vec_hit("A", 0.1)],
            0.5,
            10,
        );
        assert_eq!(order(&fused), vec!["A", "B"]);
        assert_eq!(fused[0].vector_score, Some(0.9));
    }

    #[test]
    fn test_fuse_truncates_to_k() {
        let fused = fuse(
            vec![lex("A", 3.0), lex("B", 2.0), lex("C", 1.0)],
            Vec::new(),
            0.5,
            2,
        );
        assert_eq!(order(&fused), vec!["A", "B"]);
    }

    struct FixedLexical(Vec<LexicalHit>);

    impl LexicalSearch for FixedLexical {
        fn search(&self, _query: &str, k: usize) -> Result<Vec<LexicalHit>> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    struct BrokenProvider;

    impl EmbeddingProvider for BrokenProvider {
        fn model_id(&self) -> &str {
            "broken"
        }

        fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(RetrievalError::permanent("HTTP status 401"))
        }
    }

    fn store_with(dir: &TempDir, provider: &HashProvider, texts: &[(&str, &str)]) -> VectorStore {
        let mut store = VectorStore::open(dir.path(), 16).unwrap();
        let records = texts
            .iter()
            .map(|(id, text)| {
                VectorRecord::new(*id, provider.vector_for(text)).with_field("space", "ENG")
            })
            .collect();
        store.upsert(records).unwrap();
        store
    }

    #[test]
    fn test_semantic_search_finds_exact_text() {
        let dir = TempDir::new().unwrap();
        let provider = HashProvider::new(16);
        let store = store_with(&dir, &provider, &[("a", "alpha beta"), ("b", "gamma delta")]);
        let client = EmbeddingClient::new(Box::new(HashProvider::new(16)), 16);

        let searcher = HybridSearcher::new(&client, &store, None, HybridConfig::default());
        let outcome = searcher
            .search(SearchMode::Semantic, "gamma delta", 1, &SearchFilters::new())
            .unwrap();
        assert_eq!(order(&outcome.hits), vec!["b"]);
        assert!((outcome.hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hybrid_combines_channels() {
        let dir = TempDir::new().unwrap();
        let provider = HashProvider::new(16);
        let store = store_with(&dir, &provider, &[("a", "alpha beta"), ("b", "gamma delta")]);
        let client = EmbeddingClient::new(Box::new(HashProvider::new(16)), 16);
        let lexical = FixedLexical(vec![lex("b", 4.0), lex("c", 1.0)]);

        let searcher =
            HybridSearcher::new(&client, &store, Some(&lexical), HybridConfig::new(0.5));
        let outcome = searcher
            .search(SearchMode::Hybrid, "gamma delta", 5, &SearchFilters::new())
            .unwrap();
        assert!(!outcome.fallback);
        assert_eq!(outcome.hits[0].id, "b");
        assert!((outcome.hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_embedding_failure_reported_by_default() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &HashProvider::new(16), &[("a", "alpha")]);
        let client = EmbeddingClient::new(Box::new(BrokenProvider), 16);
        let lexical = FixedLexical(vec![lex("a", 2.0)]);

        let searcher =
            HybridSearcher::new(&client, &store, Some(&lexical), HybridConfig::default());
        assert!(searcher
            .search(SearchMode::Hybrid, "alpha", 5, &SearchFilters::new())
            .is_err());
    }

    #[test]
    fn test_embedding_failure_falls_back_when_allowed() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &HashProvider::new(16), &[("a", "alpha")]);
        let client = EmbeddingClient::new(Box::new(BrokenProvider), 16);
        let lexical = FixedLexical(vec![lex("a", 2.0), lex("z", 1.0)]);

        let config = HybridConfig::default().with_fallback(true);
        let searcher = HybridSearcher::new(&client, &store, Some(&lexical), config);
        let outcome = searcher
            .search(SearchMode::Hybrid, "alpha", 5, &SearchFilters::new())
            .unwrap();
        assert!(outcome.fallback);
        assert_eq!(order(&outcome.hits), vec!["a", "z"]);
        assert!(outcome.hits.iter().all(|h| h.vector_score.is_none()));
    }

    #[test]
    fn test_keyword_mode_applies_filters() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &HashProvider::new(16), &[("a", "alpha")]);
        let client = EmbeddingClient::new(Box::new(HashProvider::new(16)), 16);
        let mut other = lex("x", 5.0);
        other.fields.insert("space".into(), Value::String("HR".into()));
        let lexical = FixedLexical(vec![other, lex("a", 2.0)]);

        let searcher =
            HybridSearcher::new(&client, &store, Some(&lexical), HybridConfig::default());
        let filters = SearchFilters::new().spaces(["ENG"]);
        let outcome = searcher
            .search(SearchMode::Keyword, "alpha", 5, &filters)
            .unwrap();
        assert_eq!(order(&outcome.hits), vec!["a"]);
        assert_eq!(outcome.hits[0].score, 2.0);
    }
}
