//! Core traits defining the interfaces between components.

use async_trait::async_trait;
use ulid::Ulid;

use crate::error::Result;
use crate::types::{Candidate, Chunk, Collection, Document, DocumentStatus, SearchFilter, Stats};

/// Per-call parameters for the vector index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorSearchParams {
    /// Query-time HNSW search breadth. Higher improves recall at added cost.
    pub ef_search: usize,

    /// Drop candidates whose similarity is not strictly above this value.
    pub threshold: Option<f32>,
}

impl VectorSearchParams {
    pub fn new(ef_search: usize) -> Self {
        Self {
            ef_search,
            threshold: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }
}

/// Approximate nearest-neighbor search over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return at most `k` candidates ordered by cosine similarity descending,
    /// ties broken by ascending chunk id.
    async fn search_by_vector(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SearchFilter,
        params: VectorSearchParams,
    ) -> Result<Vec<Candidate>>;

    /// Embedding dimension the index was built for.
    fn dimension(&self) -> usize;
}

/// Full-text search over chunk content.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Return at most `k` chunks matching at least one query term, ordered by
    /// lexical relevance descending, ties broken by ascending chunk id.
    async fn search_by_keywords(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<Candidate>>;
}

/// Document metadata store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    // Collection operations
    async fn create_collection(&self, collection: Collection) -> Result<()>;
    async fn get_collection(&self, id: Ulid) -> Result<Option<Collection>>;
    async fn add_document_to_collection(&self, collection_id: Ulid, document_id: Ulid) -> Result<()>;

    // Document operations
    async fn insert_document(&self, doc: Document) -> Result<()>;
    async fn get_document(&self, id: Ulid) -> Result<Option<Document>>;
    async fn list_documents(&self, user_id: Option<Ulid>, limit: u32, offset: u32) -> Result<Vec<Document>>;
    async fn update_document_status(&self, id: Ulid, status: DocumentStatus) -> Result<()>;

    /// Delete a document together with all of its chunks and their vectors.
    async fn delete_document(&self, id: Ulid) -> Result<()>;

    // Chunk operations
    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()>;
    async fn get_chunk(&self, id: Ulid) -> Result<Option<Chunk>>;
    async fn get_chunks_for_document(&self, document_id: Ulid) -> Result<Vec<Chunk>>;

    /// Remove chunks whose document no longer exists. Returns the number removed.
    async fn remove_orphaned_chunks(&self) -> Result<u64>;

    // Stats
    async fn get_stats(&self, collection_id: Option<Ulid>) -> Result<Stats>;
}
