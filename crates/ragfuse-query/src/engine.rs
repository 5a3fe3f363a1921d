//! Query engine for hybrid search.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use ulid::Ulid;

use ragfuse_core::{
    Adapter, Candidate, FusedResult, KeywordIndex, Metadata, RagConfig, RagError, Result,
    SearchFilter, SimilarChunk, VectorIndex, VectorSearchParams,
};

use crate::fusion::{assign_ranks, reciprocal_rank_fusion, RrfParams};

/// Engine-wide defaults, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default number of hybrid results.
    pub default_match_count: usize,

    /// Default number of pure vector results.
    pub similar_match_count: usize,

    /// Default keyword weight for hybrid search.
    pub keyword_weight: f32,

    /// RRF smoothing constant.
    pub rrf_k: u32,

    /// Candidates fetched per source = `match_count * oversample_factor`.
    pub oversample_factor: usize,

    /// HNSW search breadth passed to every vector call.
    pub ef_search: usize,

    /// Default similarity cutoff for pure vector search.
    pub match_threshold: f32,

    /// Default deadline for each adapter call.
    pub adapter_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&RagConfig::default())
    }
}

impl From<&RagConfig> for EngineConfig {
    fn from(config: &RagConfig) -> Self {
        Self {
            default_match_count: config.search.default_match_count,
            similar_match_count: config.search.similar_match_count,
            keyword_weight: config.search.keyword_weight,
            rrf_k: config.search.rrf_k,
            oversample_factor: config.search.oversample_factor.max(1),
            ef_search: config.index.ef_search,
            match_threshold: config.search.match_threshold,
            adapter_timeout: Duration::from_millis(config.search.adapter_timeout_ms),
        }
    }
}

/// Hybrid (vector + keyword) search request.
#[derive(Debug, Clone, Default)]
pub struct HybridSearchRequest {
    pub query_text: String,
    pub query_embedding: Vec<f32>,

    /// Number of results; engine default when `None`.
    pub match_count: Option<usize>,

    /// Keyword ranking weight in [0, 1]; engine default when `None`.
    pub keyword_weight: Option<f32>,

    pub filter_collection_id: Option<Ulid>,
    pub filter_user_id: Option<Ulid>,

    /// Per-adapter deadline; engine default when `None`.
    pub timeout: Option<Duration>,
}

impl HybridSearchRequest {
    pub fn new(query_text: impl Into<String>, query_embedding: Vec<f32>) -> Self {
        Self {
            query_text: query_text.into(),
            query_embedding,
            ..Default::default()
        }
    }
}

/// Pure vector search request.
#[derive(Debug, Clone, Default)]
pub struct SimilarChunksRequest {
    pub query_embedding: Vec<f32>,
    pub match_threshold: Option<f32>,
    pub match_count: Option<usize>,
    pub filter_collection_id: Option<Ulid>,
    pub filter_user_id: Option<Ulid>,
    pub timeout: Option<Duration>,
}

impl SimilarChunksRequest {
    pub fn new(query_embedding: Vec<f32>) -> Self {
        Self {
            query_embedding,
            ..Default::default()
        }
    }
}

/// Vector search restricted to chunks whose metadata contains every given pair.
#[derive(Debug, Clone, Default)]
pub struct FilteredSearchRequest {
    pub query_embedding: Vec<f32>,
    pub metadata: Metadata,
    pub match_threshold: Option<f32>,
    pub match_count: Option<usize>,
    pub filter_collection_id: Option<Ulid>,
    pub filter_user_id: Option<Ulid>,
    pub timeout: Option<Duration>,
}

/// Keyword-only search request.
#[derive(Debug, Clone, Default)]
pub struct KeywordSearchRequest {
    pub query_text: String,
    pub match_count: Option<usize>,
    pub filter_collection_id: Option<Ulid>,
    pub filter_user_id: Option<Ulid>,
    pub timeout: Option<Duration>,
}

/// Hybrid search query engine.
///
/// Runs vector similarity search and keyword search concurrently, each under
/// its own deadline, then fuses the two rankings with weighted Reciprocal Rank
/// Fusion. A failing or slow source degrades the query to the other source.
pub struct QueryEngine<V, K> {
    /// Embedding index.
    vector: Arc<V>,

    /// Lexical index.
    keyword: Arc<K>,

    config: EngineConfig,
}

impl<V, K> QueryEngine<V, K>
where
    V: VectorIndex,
    K: KeywordIndex,
{
    /// Create a new query engine.
    pub fn new(vector: Arc<V>, keyword: Arc<K>, config: EngineConfig) -> Self {
        Self {
            vector,
            keyword,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Perform a hybrid search.
    pub async fn hybrid_search(&self, request: HybridSearchRequest) -> Result<Vec<FusedResult>> {
        let start = Instant::now();

        let match_count = request.match_count.unwrap_or(self.config.default_match_count);
        let keyword_weight = request.keyword_weight.unwrap_or(self.config.keyword_weight);

        validate_match_count(match_count)?;
        validate_keyword_weight(keyword_weight)?;
        self.validate_embedding(&request.query_embedding)?;
        validate_query_text(&request.query_text)?;

        let fetch_k = self.fetch_count(match_count);
        let deadline = request.timeout.unwrap_or(self.config.adapter_timeout);
        let filter = SearchFilter {
            collection_id: request.filter_collection_id,
            user_id: request.filter_user_id,
            ..Default::default()
        };
        let params = VectorSearchParams::new(self.config.ef_search);

        info!("Hybrid search for: {:?}", request.query_text);

        // Perform searches in parallel
        let (vector_results, keyword_results) = tokio::join!(
            within_deadline(
                Adapter::Vector,
                deadline,
                self.vector
                    .search_by_vector(&request.query_embedding, fetch_k, &filter, params),
            ),
            within_deadline(
                Adapter::Keyword,
                deadline,
                self.keyword
                    .search_by_keywords(&request.query_text, fetch_k, &filter),
            )
        );

        let (vector, keyword) = match (vector_results, keyword_results) {
            (Ok(v), Ok(k)) => (v, k),
            (Err(e), _) if e.is_input_error() => return Err(e),
            (_, Err(e)) if e.is_input_error() => return Err(e),
            (Err(ve), Err(ke)) => {
                return Err(RagError::RetrievalUnavailable {
                    vector: ve.to_string(),
                    keyword: ke.to_string(),
                })
            }
            (Err(e), Ok(k)) => {
                warn!("Continuing with keyword results only: {}", e);
                (Vec::new(), k)
            }
            (Ok(v), Err(e)) => {
                warn!("Continuing with vector results only: {}", e);
                (v, Vec::new())
            }
        };

        debug!(
            "Vector search returned {} results, keyword search returned {} results",
            vector.len(),
            keyword.len()
        );

        let fused = reciprocal_rank_fusion(
            &vector,
            &keyword,
            RrfParams {
                rrf_k: self.config.rrf_k,
                keyword_weight,
            },
            match_count,
        );

        info!(
            "Hybrid search completed in {}ms, returned {} results",
            start.elapsed().as_millis(),
            fused.len()
        );

        Ok(fused)
    }

    /// Pure vector search above a similarity threshold.
    pub async fn search_similar_chunks(
        &self,
        request: SimilarChunksRequest,
    ) -> Result<Vec<SimilarChunk>> {
        let match_count = request.match_count.unwrap_or(self.config.similar_match_count);
        let filter = SearchFilter {
            collection_id: request.filter_collection_id,
            user_id: request.filter_user_id,
            ..Default::default()
        };

        self.similar(
            &request.query_embedding,
            request.match_threshold,
            match_count,
            &filter,
            request.timeout,
        )
        .await
    }

    /// Pure vector search keeping only chunks whose metadata contains every
    /// requested key/value pair.
    pub async fn filtered_semantic_search(
        &self,
        request: FilteredSearchRequest,
    ) -> Result<Vec<SimilarChunk>> {
        let match_count = request.match_count.unwrap_or(self.config.similar_match_count);
        let filter = SearchFilter {
            collection_id: request.filter_collection_id,
            user_id: request.filter_user_id,
            metadata: request.metadata,
        };

        self.similar(
            &request.query_embedding,
            request.match_threshold,
            match_count,
            &filter,
            request.timeout,
        )
        .await
    }

    /// Keyword-only search.
    pub async fn keyword_search(&self, request: KeywordSearchRequest) -> Result<Vec<Candidate>> {
        let start = Instant::now();

        let match_count = request.match_count.unwrap_or(self.config.default_match_count);
        validate_match_count(match_count)?;
        validate_query_text(&request.query_text)?;

        let filter = SearchFilter {
            collection_id: request.filter_collection_id,
            user_id: request.filter_user_id,
            ..Default::default()
        };
        let deadline = request.timeout.unwrap_or(self.config.adapter_timeout);

        let mut results = within_deadline(
            Adapter::Keyword,
            deadline,
            self.keyword
                .search_by_keywords(&request.query_text, match_count, &filter),
        )
        .await?;
        results.truncate(match_count);

        info!(
            "Keyword search completed in {}ms, returned {} results",
            start.elapsed().as_millis(),
            results.len()
        );

        Ok(results)
    }

    async fn similar(
        &self,
        embedding: &[f32],
        threshold: Option<f32>,
        match_count: usize,
        filter: &SearchFilter,
        timeout: Option<Duration>,
    ) -> Result<Vec<SimilarChunk>> {
        let start = Instant::now();

        let threshold = threshold.unwrap_or(self.config.match_threshold);
        validate_match_count(match_count)?;
        if !threshold.is_finite() {
            return Err(RagError::invalid_argument("match_threshold must be finite"));
        }
        self.validate_embedding(embedding)?;

        let deadline = timeout.unwrap_or(self.config.adapter_timeout);
        let params = VectorSearchParams::new(self.config.ef_search).with_threshold(threshold);

        let candidates = within_deadline(
            Adapter::Vector,
            deadline,
            self.vector.search_by_vector(embedding, match_count, filter, params),
        )
        .await?;

        let results: Vec<SimilarChunk> = candidates
            .into_iter()
            .filter(|c| c.score > threshold)
            .filter(|c| filter.matches_metadata(&c.metadata))
            .take(match_count)
            .map(SimilarChunk::from)
            .collect();

        info!(
            "Vector search completed in {}ms, returned {} results",
            start.elapsed().as_millis(),
            results.len()
        );

        Ok(results)
    }

    fn fetch_count(&self, match_count: usize) -> usize {
        match_count.saturating_mul(self.config.oversample_factor)
    }

    fn validate_embedding(&self, embedding: &[f32]) -> Result<()> {
        let expected = self.vector.dimension();
        if embedding.len() != expected {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(RagError::invalid_argument("query_embedding contains non-finite values"));
        }
        Ok(())
    }
}

/// Await an adapter call under a deadline and rank its output.
///
/// Input errors pass through unchanged; anything else is reported as an
/// adapter failure so the caller can degrade.
async fn within_deadline<F>(adapter: Adapter, deadline: Duration, search: F) -> Result<Vec<Candidate>>
where
    F: Future<Output = Result<Vec<Candidate>>>,
{
    match tokio::time::timeout(deadline, search).await {
        Ok(Ok(candidates)) => Ok(assign_ranks(candidates)),
        Ok(Err(e)) if e.is_input_error() => Err(e),
        Ok(Err(e)) => Err(RagError::AdapterFailed {
            adapter,
            message: e.to_string(),
        }),
        Err(_) => Err(RagError::AdapterTimeout {
            adapter,
            timeout_ms: deadline.as_millis() as u64,
        }),
    }
}

fn validate_match_count(match_count: usize) -> Result<()> {
    if match_count == 0 {
        return Err(RagError::invalid_argument("match_count must be at least 1"));
    }
    Ok(())
}

fn validate_keyword_weight(weight: f32) -> Result<()> {
    if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
        return Err(RagError::invalid_argument(format!(
            "keyword_weight must be within [0, 1], got {}",
            weight
        )));
    }
    Ok(())
}

fn validate_query_text(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        return Err(RagError::invalid_query("query text is empty"));
    }
    Ok(())
}
