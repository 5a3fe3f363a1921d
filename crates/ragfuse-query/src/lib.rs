//! ragfuse-query - Search and ranking engine
//!
//! This crate provides hybrid search combining vector similarity and keyword
//! search using weighted Reciprocal Rank Fusion (RRF), plus the background
//! reconciler that keeps chunks consistent with their documents.
//!
//! # Features
//!
//! - Hybrid search with concurrent, deadline-bounded adapters
//! - Degradation to a single source when the other fails
//! - Pure vector and metadata-filtered semantic search
//! - Configurable weights, RRF constant and oversampling
//!
//! # Example
//!
//! ```rust,ignore
//! use ragfuse_query::{EngineConfig, HybridSearchRequest, QueryEngine};
//! use std::sync::Arc;
//!
//! let store = Arc::new(store);
//! let engine = QueryEngine::new(store.clone(), store, EngineConfig::from(&config));
//! let results = engine
//!     .hybrid_search(HybridSearchRequest::new("error handling", embedding))
//!     .await?;
//! ```

mod engine;
mod fusion;
mod reconcile;

pub use engine::{
    EngineConfig, FilteredSearchRequest, HybridSearchRequest, KeywordSearchRequest, QueryEngine,
    SimilarChunksRequest,
};
pub use fusion::{assign_ranks, reciprocal_rank_fusion, RrfParams, DEFAULT_RRF_K};
pub use reconcile::ConsistencyReconciler;

// Re-export for convenience
pub use ragfuse_core::{Candidate, FusedResult, SimilarChunk};
