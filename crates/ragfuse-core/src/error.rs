//! Error types for the retrieval engine.

use thiserror::Error;

use crate::types::{Adapter, DocumentStatus};

/// Result type alias using RagError.
pub type Result<T> = std::result::Result<T, RagError>;

/// Errors that can occur in the retrieval engine.
#[derive(Error, Debug)]
pub enum RagError {
    /// Invalid argument provided by the caller.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Query text is empty or contains only stopwords.
    #[error("Invalid query: {message}")]
    InvalidQuery { message: String },

    /// Embedding length does not match the configured dimension.
    #[error("Dimension mismatch: expected {expected} components, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A search adapter did not answer before its deadline.
    #[error("{adapter} search timed out after {timeout_ms}ms")]
    AdapterTimeout { adapter: Adapter, timeout_ms: u64 },

    /// A search adapter failed.
    #[error("{adapter} search failed: {message}")]
    AdapterFailed { adapter: Adapter, message: String },

    /// Both search sources failed; the query cannot be answered.
    #[error("Retrieval unavailable: vector search: {vector}; keyword search: {keyword}")]
    RetrievalUnavailable { vector: String, keyword: String },

    /// Document not found.
    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    /// Collection not found.
    #[error("Collection not found: {id}")]
    CollectionNotFound { id: String },

    /// Document status may only move forward.
    #[error("Invalid status transition for document {id}: {from} -> {to}")]
    InvalidStatusTransition {
        id: String,
        from: DocumentStatus,
        to: DocumentStatus,
    },

    /// Database error.
    #[error("Database error: {message}")]
    Database { message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RagError {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error is a caller bug that must not be retried or degraded.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument { .. } | Self::InvalidQuery { .. } | Self::DimensionMismatch { .. }
        )
    }

    /// Whether the caller may retry the request with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RetrievalUnavailable { .. }
                | Self::AdapterTimeout { .. }
                | Self::AdapterFailed { .. }
        )
    }

    /// Get a stable error code for callers and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::InvalidQuery { .. } => "INVALID_QUERY",
            Self::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            Self::AdapterTimeout { .. } => "ADAPTER_TIMEOUT",
            Self::AdapterFailed { .. } => "ADAPTER_FAILED",
            Self::RetrievalUnavailable { .. } => "RETRIEVAL_UNAVAILABLE",
            Self::DocumentNotFound { .. } => "DOCUMENT_NOT_FOUND",
            Self::CollectionNotFound { .. } => "COLLECTION_NOT_FOUND",
            Self::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}
