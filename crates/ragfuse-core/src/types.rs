//! Core domain types for the retrieval engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::RagError;

/// Free-form key/value metadata attached to documents and chunks.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Dimension of the embeddings produced by the default embedding model.
pub const DEFAULT_DIMENSION: usize = 768;

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Processing status of a document in the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    /// Position in the pipeline; terminal states share the last stage.
    fn stage(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Check whether the status can move to `next`.
    ///
    /// Transitions only move forward. Staying in the same status is allowed,
    /// switching between the two terminal states is not.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        *self == next || next.stage() > self.stage()
    }

    /// Whether the document has finished processing.
    pub fn is_terminal(&self) -> bool {
        self.stage() == 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RagError::invalid_argument(format!(
                "unknown document status: {other}"
            ))),
        }
    }
}

/// The search source a candidate list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adapter {
    Vector,
    Keyword,
}

impl std::fmt::Display for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vector => write!(f, "vector"),
            Self::Keyword => write!(f, "keyword"),
        }
    }
}

/// A document in the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier (ULID).
    pub id: Ulid,

    /// Original filename or label.
    pub filename: String,

    /// Processing status.
    pub status: DocumentStatus,

    /// Number of live chunks referencing this document.
    pub chunk_count: u32,

    /// Owning user, if any.
    pub user_id: Option<Ulid>,

    /// User-provided metadata.
    #[serde(default)]
    pub metadata: Metadata,

    /// Creation timestamp (Unix millis).
    pub created_at: u64,

    /// Last update timestamp (Unix millis).
    pub updated_at: u64,
}

impl Document {
    /// Create a new pending document.
    pub fn new(filename: &str, user_id: Option<Ulid>) -> Self {
        let now = now_millis();

        Self {
            id: Ulid::new(),
            filename: filename.to_string(),
            status: DocumentStatus::Pending,
            chunk_count: 0,
            user_id,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A chunk of a document, the atomic unit of retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique identifier (ULID).
    pub id: Ulid,

    /// Parent document ID.
    pub document_id: Ulid,

    /// Index within the document (0-based).
    pub chunk_index: u32,

    /// Chunk text content.
    pub content: String,

    /// Embedding vector produced by the external embedding service.
    pub embedding: Vec<f32>,

    /// Chunk-level metadata.
    #[serde(default)]
    pub metadata: Metadata,

    /// Creation timestamp (Unix millis).
    pub created_at: u64,
}

impl Chunk {
    /// Create a new chunk.
    pub fn new(document_id: Ulid, chunk_index: u32, content: &str, embedding: Vec<f32>) -> Self {
        Self {
            id: Ulid::new(),
            document_id,
            chunk_index,
            content: content.to_string(),
            embedding,
            metadata: Metadata::new(),
            created_at: now_millis(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// A named group of documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    /// Unique identifier (ULID).
    pub id: Ulid,

    /// Owning user, if any.
    pub user_id: Option<Ulid>,

    /// Collection name.
    pub name: String,

    /// Optional description.
    pub description: Option<String>,

    /// Creation timestamp (Unix millis).
    pub created_at: u64,
}

impl Collection {
    /// Create a new collection.
    pub fn new(name: &str, user_id: Option<Ulid>) -> Self {
        Self {
            id: Ulid::new(),
            user_id,
            name: name.to_string(),
            description: None,
            created_at: now_millis(),
        }
    }
}

/// Restricts the candidate pool before ranking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Only chunks of documents in this collection.
    pub collection_id: Option<Ulid>,

    /// Only chunks of documents owned by this user.
    pub user_id: Option<Ulid>,

    /// Only chunks whose metadata contains every one of these pairs.
    #[serde(default)]
    pub metadata: Metadata,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.collection_id.is_none() && self.user_id.is_none() && self.metadata.is_empty()
    }

    /// Whether `metadata` carries every required key with an equal value.
    pub fn matches_metadata(&self, metadata: &Metadata) -> bool {
        self.metadata
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }
}

/// A ranked hit from a single search source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub chunk_id: Ulid,
    pub document_id: Ulid,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,

    /// Similarity (vector) or lexical relevance (keyword); higher is better.
    pub score: f32,

    /// 1-based rank within the source list.
    pub rank: u32,
}

/// A hybrid search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub id: Ulid,
    pub document_id: Ulid,
    pub content: String,
    pub metadata: Metadata,

    /// Cosine similarity, or 0.0 when the vector source did not return the chunk.
    pub vector_score: f32,

    /// Lexical relevance, or 0.0 when the keyword source did not return the chunk.
    pub keyword_score: f32,

    /// Reciprocal rank fusion score; determines output order.
    pub combined_score: f64,
}

/// A pure vector search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarChunk {
    pub id: Ulid,
    pub document_id: Ulid,
    pub content: String,
    pub metadata: Metadata,
    pub similarity: f32,
}

impl From<Candidate> for SimilarChunk {
    fn from(c: Candidate) -> Self {
        Self {
            id: c.chunk_id,
            document_id: c.document_id,
            content: c.content,
            metadata: c.metadata,
            similarity: c.score,
        }
    }
}

/// Statistics about the knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    /// Number of collections.
    pub collections: u64,

    /// Number of documents.
    pub documents: u64,

    /// Number of chunks.
    pub chunks: u64,

    /// Number of live vectors in the ANN index.
    pub indexed_vectors: u64,

    /// Optional collection filter applied.
    pub filter: Option<Ulid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_forward_only() {
        use DocumentStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Processing));

        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_round_trip_str() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("archived".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_new_document_is_pending() {
        let doc = Document::new("notes.md", None);
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert_eq!(doc.chunk_count, 0);
        assert!(!doc.status.is_terminal());
    }

    #[test]
    fn test_fused_result_serializes_scores() {
        let result = FusedResult {
            id: Ulid::from(1u128),
            document_id: Ulid::from(2u128),
            content: "text".to_string(),
            metadata: Metadata::new(),
            vector_score: 0.5,
            keyword_score: 0.0,
            combined_score: 0.01,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["keyword_score"], 0.0);
        assert!(json.get("combined_score").is_some());
    }
}
