//! ragfuse-store - SQLite storage layer with an in-process HNSW index
//!
//! This crate persists documents, collections and chunks in SQLite, serves
//! keyword search from an FTS5 table and vector search from an HNSW graph
//! kept in memory and rebuilt from stored embeddings on open.

mod hnsw;
mod schema;
mod sqlite;

pub use hnsw::{HnswIndex, HnswParams};
pub use sqlite::SqliteStore;

// Re-export schema for testing/migrations
pub use schema::{SCHEMA, SCHEMA_VERSION};
