//! Configuration types for the retrieval engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{RagError, Result};
use crate::types::DEFAULT_DIMENSION;

/// Main configuration for the retrieval engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Vector index configuration.
    #[serde(default)]
    pub index: IndexConfig,

    /// Search configuration.
    #[serde(default)]
    pub search: SearchConfig,

    /// Consistency reconciler configuration.
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: 30000,
        }
    }
}

/// HNSW vector index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Embedding dimension; every chunk embedding must match exactly.
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Maximum connections per node above layer 0.
    #[serde(default = "default_m")]
    pub m: usize,

    /// Candidate list size while building the graph.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    /// Default candidate list size at query time.
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    /// Seed for level assignment, keeps graph construction reproducible.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            m: 16,
            ef_construction: 64,
            ef_search: 100,
            seed: default_seed(),
        }
    }
}

/// Search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default number of hybrid search results.
    #[serde(default = "default_match_count")]
    pub default_match_count: usize,

    /// Default number of pure vector search results.
    #[serde(default = "default_similar_match_count")]
    pub similar_match_count: usize,

    /// Blend between vector (0) and keyword (1) rankings.
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,

    /// RRF smoothing constant k.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,

    /// Each source is asked for `match_count * oversample_factor` candidates.
    #[serde(default = "default_oversample_factor")]
    pub oversample_factor: usize,

    /// Similarity cutoff for pure vector search (strictly greater passes).
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,

    /// Deadline for a single adapter call in milliseconds.
    #[serde(default = "default_adapter_timeout")]
    pub adapter_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_match_count: 10,
            similar_match_count: 5,
            keyword_weight: 0.3,
            rrf_k: 60,
            oversample_factor: 2,
            match_threshold: 0.7,
            adapter_timeout_ms: 5000,
        }
    }
}

/// Consistency reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Interval between orphaned chunk scans in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 3600 }
    }
}

// Default value functions

fn default_busy_timeout() -> u32 {
    30000
}

fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}

fn default_m() -> usize {
    16
}

fn default_ef_construction() -> usize {
    64
}

fn default_ef_search() -> usize {
    100
}

fn default_seed() -> u64 {
    0x5eed
}

fn default_match_count() -> usize {
    10
}

fn default_similar_match_count() -> usize {
    5
}

fn default_keyword_weight() -> f32 {
    0.3
}

fn default_rrf_k() -> u32 {
    60
}

fn default_oversample_factor() -> usize {
    2
}

fn default_match_threshold() -> f32 {
    0.7
}

fn default_adapter_timeout() -> u64 {
    5000
}

fn default_reconcile_interval() -> u64 {
    3600
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ragfuse")
        .join("ragfuse.db")
}

impl RagConfig {
    /// Load configuration from file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RagError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> Result<Self> {
        // Try user config first
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("ragfuse").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        // Try local config
        let local_config = PathBuf::from("ragfuse.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        // Return defaults
        Ok(Self::default())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.index.dimension == 0 {
            return Err(RagError::config("index.dimension must be positive"));
        }
        if self.index.m < 2 {
            return Err(RagError::config("index.m must be at least 2"));
        }
        if self.index.ef_construction == 0 || self.index.ef_search == 0 {
            return Err(RagError::config("index ef values must be positive"));
        }
        if !(0.0..=1.0).contains(&self.search.keyword_weight) {
            return Err(RagError::config("search.keyword_weight must be within [0, 1]"));
        }
        if self.search.oversample_factor == 0 {
            return Err(RagError::config("search.oversample_factor must be at least 1"));
        }
        if self.search.default_match_count == 0 || self.search.similar_match_count == 0 {
            return Err(RagError::config("search match counts must be at least 1"));
        }
        if !self.search.match_threshold.is_finite() {
            return Err(RagError::config("search.match_threshold must be finite"));
        }
        Ok(())
    }
}
