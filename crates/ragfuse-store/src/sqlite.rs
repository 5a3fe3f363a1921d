//! SQLite-based storage implementation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};
use ulid::Ulid;

use ragfuse_core::{
    now_millis, Candidate, Chunk, Collection, Document, DocumentStatus, DocumentStore,
    KeywordIndex, RagConfig, RagError, Result, SearchFilter, Stats, VectorIndex,
    VectorSearchParams,
};

use crate::hnsw::{HnswIndex, HnswParams};
use crate::schema::{SCHEMA, SCHEMA_VERSION, STOPWORDS};

/// SQLite-based store implementation.
///
/// Documents, collections and chunks live in SQLite, keyword search runs on
/// an FTS5 table, and chunk embeddings are served from an in-memory HNSW
/// graph rebuilt from the `chunks` table on open. All SQLite work runs on
/// the blocking thread pool via `spawn_blocking`.
pub struct SqliteStore {
    /// Connection wrapped in blocking Mutex.
    conn: Arc<Mutex<Connection>>,

    /// ANN index over chunk embeddings.
    vectors: Arc<RwLock<HnswIndex>>,

    /// Embedding dimension.
    dimension: usize,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>, config: &RagConfig) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RagError::database(format!("Failed to open database: {}", e)))?;

        Self::init(conn, config, path)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory(config: &RagConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RagError::database(format!("Failed to open in-memory database: {}", e)))?;

        Self::init(conn, config, Path::new(":memory:"))
    }

    /// Initialize the store with a connection.
    fn init(conn: Connection, config: &RagConfig, path: &Path) -> Result<Self> {
        config.validate()?;
        Self::configure_connection(&conn, config.database.busy_timeout_ms)?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| RagError::database(format!("Failed to initialize schema: {}", e)))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| RagError::database(e.to_string()))?;

        let dimension = config.index.dimension;
        let vectors = Self::load_vectors(&conn, dimension, HnswParams::from(&config.index))?;

        info!(
            "Database opened at {:?} ({} vectors indexed)",
            path,
            vectors.len()
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            vectors: Arc::new(RwLock::new(vectors)),
            dimension,
        })
    }

    /// Configure SQLite connection for optimal performance.
    fn configure_connection(conn: &Connection, busy_timeout_ms: u32) -> Result<()> {
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA busy_timeout = {busy_timeout_ms};
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#
        ))
        .map_err(|e| RagError::database(format!("Failed to configure connection: {}", e)))?;

        Ok(())
    }

    /// Rebuild the HNSW graph from persisted embeddings in insertion order.
    fn load_vectors(conn: &Connection, dimension: usize, params: HnswParams) -> Result<HnswIndex> {
        let mut index = HnswIndex::new(dimension, params);

        let mut stmt = conn
            .prepare("SELECT id, embedding FROM chunks ORDER BY rowid")
            .map_err(|e| RagError::database(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                let id = parse_ulid(row, 0)?;
                let bytes: Vec<u8> = row.get(1)?;
                Ok((id, bytes_to_vec(&bytes)))
            })
            .map_err(|e| RagError::database(e.to_string()))?;

        for row in rows {
            let (id, embedding) = row.map_err(|e| RagError::database(e.to_string()))?;
            if embedding.len() != dimension {
                return Err(RagError::config(format!(
                    "stored embedding for chunk {} has {} components, index expects {}",
                    id,
                    embedding.len(),
                    dimension
                )));
            }
            index.insert(id, &embedding)?;
        }

        Ok(index)
    }

    /// Run a closure against the connection and vector index on the blocking pool.
    async fn with_parts<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Mutex<Connection>, &RwLock<HnswIndex>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let vectors = Arc::clone(&self.vectors);

        tokio::task::spawn_blocking(move || f(&conn, &vectors))
            .await
            .map_err(|e| RagError::internal(format!("Blocking task failed: {}", e)))?
    }

    /// Execute a blocking operation on the connection.
    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.with_parts(move |conn, _| {
            let mut conn = lock(conn)?;
            f(&mut conn)
        })
        .await
    }

    /// Number of live vectors in the ANN index.
    pub fn indexed_vectors(&self) -> usize {
        self.vectors.read().map(|v| v.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    // Collection operations

    async fn create_collection(&self, collection: Collection) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO collections (id, user_id, name, description, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    collection.id.to_string(),
                    collection.user_id.map(|u| u.to_string()),
                    collection.name,
                    collection.description,
                    collection.created_at as i64,
                ],
            )
            .map_err(|e| RagError::database(format!("Failed to create collection: {}", e)))?;

            debug!("Created collection: {} ({})", collection.name, collection.id);
            Ok(())
        })
        .await
    }

    async fn get_collection(&self, id: Ulid) -> Result<Option<Collection>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, user_id, name, description, created_at FROM collections WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Collection {
                        id: parse_ulid(row, 0)?,
                        user_id: parse_optional_ulid(row, 1)?,
                        name: row.get(2)?,
                        description: row.get(3)?,
                        created_at: row.get::<_, i64>(4)? as u64,
                    })
                },
            )
            .optional()
            .map_err(|e| RagError::database(e.to_string()))
        })
        .await
    }

    async fn add_document_to_collection(&self, collection_id: Ulid, document_id: Ulid) -> Result<()> {
        self.with_conn(move |conn| {
            if !exists(conn, "SELECT 1 FROM collections WHERE id = ?1", &collection_id)? {
                return Err(RagError::CollectionNotFound {
                    id: collection_id.to_string(),
                });
            }
            if !exists(conn, "SELECT 1 FROM documents WHERE id = ?1", &document_id)? {
                return Err(RagError::DocumentNotFound {
                    id: document_id.to_string(),
                });
            }

            conn.execute(
                "INSERT OR IGNORE INTO collection_documents (collection_id, document_id) VALUES (?1, ?2)",
                params![collection_id.to_string(), document_id.to_string()],
            )
            .map_err(|e| RagError::database(e.to_string()))?;

            debug!("Added document {} to collection {}", document_id, collection_id);
            Ok(())
        })
        .await
    }

    // Document operations

    async fn insert_document(&self, doc: Document) -> Result<()> {
        let metadata = serde_json::to_string(&doc.metadata)?;

        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO documents (id, filename, status, chunk_count, user_id,
                                       metadata, created_at, updated_at)
                VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7)
                "#,
                params![
                    doc.id.to_string(),
                    doc.filename,
                    doc.status.as_str(),
                    doc.user_id.map(|u| u.to_string()),
                    metadata,
                    doc.created_at as i64,
                    doc.updated_at as i64,
                ],
            )
            .map_err(|e| RagError::database(format!("Failed to insert document: {}", e)))?;

            debug!("Inserted document: {}", doc.id);
            Ok(())
        })
        .await
    }

    async fn get_document(&self, id: Ulid) -> Result<Option<Document>> {
        self.with_conn(move |conn| {
            conn.query_row(
                r#"
                SELECT id, filename, status, chunk_count, user_id,
                       metadata, created_at, updated_at
                FROM documents WHERE id = ?1
                "#,
                params![id.to_string()],
                row_to_document,
            )
            .optional()
            .map_err(|e| RagError::database(e.to_string()))
        })
        .await
    }

    async fn list_documents(&self, user_id: Option<Ulid>, limit: u32, offset: u32) -> Result<Vec<Document>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, filename, status, chunk_count, user_id,
                           metadata, created_at, updated_at
                    FROM documents
                    WHERE ?1 IS NULL OR user_id = ?1
                    ORDER BY created_at DESC, id
                    LIMIT ?2 OFFSET ?3
                    "#,
                )
                .map_err(|e| RagError::database(e.to_string()))?;

            let documents = stmt
                .query_map(
                    params![user_id.map(|u| u.to_string()), limit, offset],
                    row_to_document,
                )
                .map_err(|e| RagError::database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| RagError::database(e.to_string()))?;

            Ok(documents)
        })
        .await
    }

    async fn update_document_status(&self, id: Ulid, status: DocumentStatus) -> Result<()> {
        self.with_conn(move |conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT status FROM documents WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RagError::database(e.to_string()))?;

            let current: DocumentStatus = current
                .ok_or_else(|| RagError::DocumentNotFound { id: id.to_string() })?
                .parse()?;

            if !current.can_transition_to(status) {
                return Err(RagError::InvalidStatusTransition {
                    id: id.to_string(),
                    from: current,
                    to: status,
                });
            }

            conn.execute(
                "UPDATE documents SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now_millis() as i64, id.to_string()],
            )
            .map_err(|e| RagError::database(e.to_string()))?;

            debug!("Document {} status {} -> {}", id, current, status);
            Ok(())
        })
        .await
    }

    async fn delete_document(&self, id: Ulid) -> Result<()> {
        self.with_parts(move |conn, vectors| {
            let mut conn = lock(conn)?;
            let tx = conn
                .transaction()
                .map_err(|e| RagError::database(e.to_string()))?;

            let chunk_ids = chunk_ids_for_document(&tx, &id)?;

            // Chunks and memberships are deleted by CASCADE
            let deleted = tx
                .execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])
                .map_err(|e| RagError::database(e.to_string()))?;

            if deleted == 0 {
                return Err(RagError::DocumentNotFound { id: id.to_string() });
            }

            tx.commit()
                .map_err(|e| RagError::database(e.to_string()))?;

            let mut vectors = vectors
                .write()
                .map_err(|e| RagError::internal(e.to_string()))?;
            for chunk_id in &chunk_ids {
                vectors.remove(chunk_id);
            }

            debug!("Deleted document {} and {} chunks", id, chunk_ids.len());
            Ok(())
        })
        .await
    }

    // Chunk operations

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            if chunk.embedding.len() != self.dimension {
                return Err(RagError::DimensionMismatch {
                    expected: self.dimension,
                    actual: chunk.embedding.len(),
                });
            }
        }

        let chunks: Vec<Chunk> = chunks.to_vec();
        self.with_parts(move |conn, vectors| {
            let mut conn = lock(conn)?;
            let tx = conn
                .transaction()
                .map_err(|e| RagError::database(e.to_string()))?;

            let mut documents: HashSet<Ulid> = HashSet::new();
            {
                let mut stmt = tx
                    .prepare(
                        r#"
                        INSERT INTO chunks (id, document_id, chunk_index, content,
                                            embedding, metadata, created_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                        "#,
                    )
                    .map_err(|e| RagError::database(e.to_string()))?;

                for chunk in &chunks {
                    if !documents.contains(&chunk.document_id)
                        && !exists(&tx, "SELECT 1 FROM documents WHERE id = ?1", &chunk.document_id)?
                    {
                        return Err(RagError::DocumentNotFound {
                            id: chunk.document_id.to_string(),
                        });
                    }
                    documents.insert(chunk.document_id);

                    stmt.execute(params![
                        chunk.id.to_string(),
                        chunk.document_id.to_string(),
                        chunk.chunk_index,
                        chunk.content,
                        vec_to_bytes(&chunk.embedding),
                        serde_json::to_string(&chunk.metadata)?,
                        chunk.created_at as i64,
                    ])
                    .map_err(|e| RagError::database(format!("Failed to insert chunk: {}", e)))?;
                }
            }

            // Keep chunk_count equal to the number of live chunks
            let now = now_millis() as i64;
            for document_id in &documents {
                tx.execute(
                    r#"
                    UPDATE documents
                    SET chunk_count = (SELECT COUNT(*) FROM chunks WHERE document_id = ?1),
                        updated_at = ?2
                    WHERE id = ?1
                    "#,
                    params![document_id.to_string(), now],
                )
                .map_err(|e| RagError::database(e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| RagError::database(e.to_string()))?;

            let mut vectors = vectors
                .write()
                .map_err(|e| RagError::internal(e.to_string()))?;
            for chunk in &chunks {
                vectors.insert(chunk.id, &chunk.embedding)?;
            }

            debug!("Inserted {} chunks", chunks.len());
            Ok(())
        })
        .await
    }

    async fn get_chunk(&self, id: Ulid) -> Result<Option<Chunk>> {
        self.with_conn(move |conn| {
            conn.query_row(
                r#"
                SELECT id, document_id, chunk_index, content, embedding, metadata, created_at
                FROM chunks WHERE id = ?1
                "#,
                params![id.to_string()],
                row_to_chunk,
            )
            .optional()
            .map_err(|e| RagError::database(e.to_string()))
        })
        .await
    }

    async fn get_chunks_for_document(&self, document_id: Ulid) -> Result<Vec<Chunk>> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT id, document_id, chunk_index, content, embedding, metadata, created_at
                    FROM chunks
                    WHERE document_id = ?1
                    ORDER BY chunk_index
                    "#,
                )
                .map_err(|e| RagError::database(e.to_string()))?;

            let chunks = stmt
                .query_map(params![document_id.to_string()], row_to_chunk)
                .map_err(|e| RagError::database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| RagError::database(e.to_string()))?;

            Ok(chunks)
        })
        .await
    }

    async fn remove_orphaned_chunks(&self) -> Result<u64> {
        self.with_parts(|conn, vectors| {
            let mut conn = lock(conn)?;
            let tx = conn
                .transaction()
                .map_err(|e| RagError::database(e.to_string()))?;

            let orphans: Vec<Ulid> = {
                let mut stmt = tx
                    .prepare(
                        r#"
                        SELECT id FROM chunks
                        WHERE document_id NOT IN (SELECT id FROM documents)
                        ORDER BY rowid
                        "#,
                    )
                    .map_err(|e| RagError::database(e.to_string()))?;
                let ids = stmt
                    .query_map([], |row| parse_ulid(row, 0))
                    .map_err(|e| RagError::database(e.to_string()))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| RagError::database(e.to_string()))?;
                ids
            };

            tx.execute(
                "DELETE FROM chunks WHERE document_id NOT IN (SELECT id FROM documents)",
                [],
            )
            .map_err(|e| RagError::database(e.to_string()))?;

            let live: HashSet<Ulid> = {
                let mut stmt = tx
                    .prepare("SELECT id FROM chunks")
                    .map_err(|e| RagError::database(e.to_string()))?;
                let ids = stmt
                    .query_map([], |row| parse_ulid(row, 0))
                    .map_err(|e| RagError::database(e.to_string()))?
                    .collect::<std::result::Result<HashSet<_>, _>>()
                    .map_err(|e| RagError::database(e.to_string()))?;
                ids
            };

            tx.commit()
                .map_err(|e| RagError::database(e.to_string()))?;

            // Drop vectors whose chunk row is gone, orphaned or otherwise
            let mut vectors = vectors
                .write()
                .map_err(|e| RagError::internal(e.to_string()))?;
            let stale: Vec<Ulid> = vectors.ids().filter(|id| !live.contains(*id)).copied().collect();
            for id in &stale {
                vectors.remove(id);
            }

            if !orphans.is_empty() || !stale.is_empty() {
                warn!(
                    "Removed {} orphaned chunks and {} stale vectors",
                    orphans.len(),
                    stale.len()
                );
            }

            Ok(orphans.len() as u64)
        })
        .await
    }

    // Stats

    async fn get_stats(&self, collection_id: Option<Ulid>) -> Result<Stats> {
        let indexed_vectors = self.indexed_vectors() as u64;

        self.with_conn(move |conn| {
            let collections: u64 = conn
                .query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))
                .map_err(|e| RagError::database(e.to_string()))?;

            let (documents, chunks): (u64, u64) = if let Some(coll) = collection_id {
                let docs: u64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM collection_documents WHERE collection_id = ?1",
                        params![coll.to_string()],
                        |row| row.get(0),
                    )
                    .map_err(|e| RagError::database(e.to_string()))?;

                let chunks: u64 = conn
                    .query_row(
                        r#"
                        SELECT COUNT(*) FROM chunks c
                        JOIN collection_documents cd ON cd.document_id = c.document_id
                        WHERE cd.collection_id = ?1
                        "#,
                        params![coll.to_string()],
                        |row| row.get(0),
                    )
                    .map_err(|e| RagError::database(e.to_string()))?;

                (docs, chunks)
            } else {
                let docs: u64 = conn
                    .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
                    .map_err(|e| RagError::database(e.to_string()))?;

                let chunks: u64 = conn
                    .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
                    .map_err(|e| RagError::database(e.to_string()))?;

                (docs, chunks)
            };

            Ok(Stats {
                collections,
                documents,
                chunks,
                indexed_vectors,
                filter: collection_id,
            })
        })
        .await
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn search_by_vector(
        &self,
        embedding: &[f32],
        k: usize,
        filter: &SearchFilter,
        params: VectorSearchParams,
    ) -> Result<Vec<Candidate>> {
        if embedding.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }

        let embedding = embedding.to_vec();
        let filter = filter.clone();

        self.with_parts(move |conn, vectors| {
            // Restrict the pool to live chunks passing the filter before ranking
            let allowed = filtered_chunk_ids(&*lock(conn)?, &filter)?;

            let mut hits = {
                let vectors = vectors
                    .read()
                    .map_err(|e| RagError::internal(e.to_string()))?;
                vectors.search(&embedding, k, params.ef_search, |id| allowed.contains(id))?
            };

            if let Some(threshold) = params.threshold {
                hits.retain(|&(_, similarity)| similarity > threshold);
            }

            let conn = lock(conn)?;
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT c.id, c.document_id, c.content, c.metadata
                    FROM chunks c
                    JOIN documents d ON d.id = c.document_id
                    WHERE c.id = ?1
                    "#,
                )
                .map_err(|e| RagError::database(e.to_string()))?;

            let mut candidates = Vec::with_capacity(hits.len());
            for (chunk_id, similarity) in hits {
                let row = stmt
                    .query_row(params![chunk_id.to_string()], |row| {
                        row_to_candidate(row, similarity)
                    })
                    .optional()
                    .map_err(|e| RagError::database(e.to_string()))?;

                // Vectors of chunks without a live document are skipped
                if let Some(mut candidate) = row {
                    candidate.rank = candidates.len() as u32 + 1;
                    candidates.push(candidate);
                }
            }

            Ok(candidates)
        })
        .await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl KeywordIndex for SqliteStore {
    async fn search_by_keywords(
        &self,
        query: &str,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<Candidate>> {
        let match_expr = fts5_match_expression(query)?;
        let filter = filter.clone();

        // Metadata is matched after the query, so the row limit only applies without it
        let limit = if filter.metadata.is_empty() {
            i64::try_from(k).unwrap_or(i64::MAX)
        } else {
            -1
        };

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT c.id, c.document_id, c.content, c.metadata,
                           -bm25(chunks_fts) AS score
                    FROM chunks_fts
                    JOIN chunks c ON c.rowid = chunks_fts.rowid
                    JOIN documents d ON d.id = c.document_id
                    WHERE chunks_fts MATCH ?1
                    AND (?2 IS NULL OR d.user_id = ?2)
                    AND (?3 IS NULL OR EXISTS (
                        SELECT 1 FROM collection_documents cd
                        WHERE cd.document_id = d.id AND cd.collection_id = ?3
                    ))
                    ORDER BY score DESC, c.id ASC
                    LIMIT ?4
                    "#,
                )
                .map_err(|e| RagError::database(e.to_string()))?;

            let mut candidates = stmt
                .query_map(
                    params![
                        match_expr,
                        filter.user_id.map(|u| u.to_string()),
                        filter.collection_id.map(|c| c.to_string()),
                        limit,
                    ],
                    |row| {
                        let score: f64 = row.get(4)?;
                        row_to_candidate(row, score as f32)
                    },
                )
                .map_err(|e| RagError::database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| RagError::database(e.to_string()))?;

            if !filter.metadata.is_empty() {
                candidates.retain(|c| filter.matches_metadata(&c.metadata));
                candidates.truncate(k);
            }

            for (i, candidate) in candidates.iter_mut().enumerate() {
                candidate.rank = i as u32 + 1;
            }

            Ok(candidates)
        })
        .await
    }
}

// Helper functions

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| RagError::database(e.to_string()))
}

fn exists(conn: &Connection, sql: &str, id: &Ulid) -> Result<bool> {
    conn.query_row(sql, params![id.to_string()], |_| Ok(()))
        .optional()
        .map(|row| row.is_some())
        .map_err(|e| RagError::database(e.to_string()))
}

fn chunk_ids_for_document(conn: &Connection, document_id: &Ulid) -> Result<Vec<Ulid>> {
    let mut stmt = conn
        .prepare("SELECT id FROM chunks WHERE document_id = ?1")
        .map_err(|e| RagError::database(e.to_string()))?;

    let ids = stmt
        .query_map(params![document_id.to_string()], |row| parse_ulid(row, 0))
        .map_err(|e| RagError::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RagError::database(e.to_string()))?;

    Ok(ids)
}

/// Ids of chunks with a live document that pass the owner, collection and
/// metadata filters.
fn filtered_chunk_ids(conn: &Connection, filter: &SearchFilter) -> Result<HashSet<Ulid>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT c.id, c.metadata
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE (?1 IS NULL OR d.user_id = ?1)
            AND (?2 IS NULL OR EXISTS (
                SELECT 1 FROM collection_documents cd
                WHERE cd.document_id = d.id AND cd.collection_id = ?2
            ))
            "#,
        )
        .map_err(|e| RagError::database(e.to_string()))?;

    let rows = stmt
        .query_map(
            params![
                filter.user_id.map(|u| u.to_string()),
                filter.collection_id.map(|c| c.to_string()),
            ],
            |row| {
                let metadata: String = row.get(1)?;
                Ok((parse_ulid(row, 0)?, metadata))
            },
        )
        .map_err(|e| RagError::database(e.to_string()))?;

    let mut ids = HashSet::new();
    for row in rows {
        let (id, metadata) = row.map_err(|e| RagError::database(e.to_string()))?;
        if filter.metadata.is_empty()
            || filter.matches_metadata(&serde_json::from_str(&metadata).unwrap_or_default())
        {
            ids.insert(id);
        }
    }

    Ok(ids)
}

/// Build an FTS5 expression matching any non-stopword term of the query.
fn fts5_match_expression(query: &str) -> Result<String> {
    let mut seen = HashSet::new();
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect();

    if terms.is_empty() {
        return Err(RagError::invalid_query(format!(
            "query has no searchable terms: {:?}",
            query
        )));
    }

    Ok(terms
        .iter()
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR "))
}

fn parse_ulid(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Ulid> {
    let s: String = row.get(idx)?;
    Ulid::from_string(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_ulid(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Ulid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        Ulid::from_string(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Convert a row to a Document.
fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    let status: String = row.get(2)?;
    let metadata: String = row.get(5)?;

    Ok(Document {
        id: parse_ulid(row, 0)?,
        filename: row.get(1)?,
        status: status
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        chunk_count: row.get(3)?,
        user_id: parse_optional_ulid(row, 4)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: row.get::<_, i64>(6)? as u64,
        updated_at: row.get::<_, i64>(7)? as u64,
    })
}

/// Convert a row to a Chunk.
fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let embedding: Vec<u8> = row.get(4)?;
    let metadata: String = row.get(5)?;

    Ok(Chunk {
        id: parse_ulid(row, 0)?,
        document_id: parse_ulid(row, 1)?,
        chunk_index: row.get(2)?,
        content: row.get(3)?,
        embedding: bytes_to_vec(&embedding),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: row.get::<_, i64>(6)? as u64,
    })
}

/// Convert `(id, document_id, content, metadata)` columns to an unranked Candidate.
fn row_to_candidate(row: &rusqlite::Row<'_>, score: f32) -> rusqlite::Result<Candidate> {
    let metadata: String = row.get(3)?;

    Ok(Candidate {
        chunk_id: parse_ulid(row, 0)?,
        document_id: parse_ulid(row, 1)?,
        content: row.get(2)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        score,
        rank: 0,
    })
}

/// Convert f32 vector to bytes (little-endian).
fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DIM: usize = 4;

    fn test_config() -> RagConfig {
        let mut config = RagConfig::default();
        config.index.dimension = DIM;
        config
    }

    fn store() -> SqliteStore {
        SqliteStore::open_memory(&test_config()).unwrap()
    }

    async fn insert_doc(store: &SqliteStore, user_id: Option<Ulid>) -> Ulid {
        let doc = Document::new("doc.md", user_id);
        let id = doc.id;
        store.insert_document(doc).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_document_crud() {
        let store = store();
        let user = Ulid::new();
        let doc_id = insert_doc(&store, Some(user)).await;

        let retrieved = store.get_document(doc_id).await.unwrap().unwrap();
        assert_eq!(retrieved.filename, "doc.md");
        assert_eq!(retrieved.status, DocumentStatus::Pending);
        assert_eq!(retrieved.user_id, Some(user));

        assert_eq!(store.list_documents(Some(user), 10, 0).await.unwrap().len(), 1);
        assert!(store.list_documents(Some(Ulid::new()), 10, 0).await.unwrap().is_empty());

        store.delete_document(doc_id).await.unwrap();
        assert!(store.get_document(doc_id).await.unwrap().is_none());
        assert!(matches!(
            store.delete_document(doc_id).await,
            Err(RagError::DocumentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_status_moves_forward_only() {
        let store = store();
        let doc_id = insert_doc(&store, None).await;

        store
            .update_document_status(doc_id, DocumentStatus::Processing)
            .await
            .unwrap();
        store
            .update_document_status(doc_id, DocumentStatus::Completed)
            .await
            .unwrap();

        let err = store
            .update_document_status(doc_id, DocumentStatus::Pending)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATUS_TRANSITION");

        let doc = store.get_document(doc_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
    }

    #[tokio::test]
    async fn test_chunk_count_tracks_live_chunks() {
        let store = store();
        let doc_id = insert_doc(&store, None).await;

        let chunks = vec![
            Chunk::new(doc_id, 0, "first chunk", vec![1.0, 0.0, 0.0, 0.0]),
            Chunk::new(doc_id, 1, "second chunk", vec![0.0, 1.0, 0.0, 0.0]),
        ];
        store.insert_chunks(&chunks).await.unwrap();

        let doc = store.get_document(doc_id).await.unwrap().unwrap();
        assert_eq!(doc.chunk_count, 2);

        let retrieved = store.get_chunks_for_document(doc_id).await.unwrap();
        assert_eq!(retrieved.len(), 2);
        assert_eq!(retrieved[1].embedding, vec![0.0, 1.0, 0.0, 0.0]);
        assert_eq!(store.indexed_vectors(), 2);
    }

    #[tokio::test]
    async fn test_insert_chunks_rejects_bad_dimension_and_missing_document() {
        let store = store();
        let doc_id = insert_doc(&store, None).await;

        let err = store
            .insert_chunks(&[Chunk::new(doc_id, 0, "short", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 4, actual: 2 }));

        let err = store
            .insert_chunks(&[Chunk::new(Ulid::new(), 0, "lost", vec![1.0; DIM])])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DocumentNotFound { .. }));
        assert_eq!(store.indexed_vectors(), 0);
    }

    #[tokio::test]
    async fn test_delete_document_cascades_to_chunks_and_vectors() {
        let store = store();
        let doc_id = insert_doc(&store, None).await;
        let chunk = Chunk::new(doc_id, 0, "tokio runtime", vec![1.0, 0.0, 0.0, 0.0]);
        let chunk_id = chunk.id;
        store.insert_chunks(&[chunk]).await.unwrap();

        store.delete_document(doc_id).await.unwrap();

        assert!(store.get_chunk(chunk_id).await.unwrap().is_none());
        assert_eq!(store.indexed_vectors(), 0);
        let hits = store
            .search_by_keywords("tokio", 10, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_similarity() {
        let store = store();
        let doc_id = insert_doc(&store, None).await;
        let chunks = vec![
            Chunk::new(doc_id, 0, "exact", vec![1.0, 0.0, 0.0, 0.0]),
            Chunk::new(doc_id, 1, "close", vec![0.9, 0.1, 0.0, 0.0]),
            Chunk::new(doc_id, 2, "far", vec![0.0, 0.0, 1.0, 0.0]),
        ];
        store.insert_chunks(&chunks).await.unwrap();

        let results = store
            .search_by_vector(
                &[1.0, 0.0, 0.0, 0.0],
                10,
                &SearchFilter::default(),
                VectorSearchParams::new(100),
            )
            .await
            .unwrap();

        let contents: Vec<&str> = results.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["exact", "close", "far"]);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[2].rank, 3);
        assert!((results[0].score - 1.0).abs() < 1e-6);

        let above = store
            .search_by_vector(
                &[1.0, 0.0, 0.0, 0.0],
                10,
                &SearchFilter::default(),
                VectorSearchParams::new(100).with_threshold(0.5),
            )
            .await
            .unwrap();
        assert_eq!(above.len(), 2);
    }

    #[tokio::test]
    async fn test_vector_search_dimension_mismatch() {
        let store = store();
        let err = store
            .search_by_vector(&[1.0; 3], 5, &SearchFilter::default(), VectorSearchParams::new(100))
            .await
            .unwrap_err();
        assert!(err.is_input_error());
    }

    #[tokio::test]
    async fn test_filters_restrict_both_sources() {
        let store = store();
        let alice = Ulid::new();
        let bob = Ulid::new();
        let alice_doc = insert_doc(&store, Some(alice)).await;
        let bob_doc = insert_doc(&store, Some(bob)).await;

        let collection = Collection::new("manuals", Some(alice));
        let collection_id = collection.id;
        store.create_collection(collection).await.unwrap();
        store
            .add_document_to_collection(collection_id, alice_doc)
            .await
            .unwrap();

        store
            .insert_chunks(&[
                Chunk::new(alice_doc, 0, "rust borrow checker", vec![1.0, 0.0, 0.0, 0.0]),
                Chunk::new(bob_doc, 0, "rust async runtime", vec![1.0, 0.1, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let by_user = SearchFilter {
            user_id: Some(bob),
            ..Default::default()
        };
        let hits = store.search_by_keywords("rust", 10, &by_user).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, bob_doc);

        let by_collection = SearchFilter {
            collection_id: Some(collection_id),
            ..Default::default()
        };
        let hits = store
            .search_by_vector(&[1.0, 0.1, 0.0, 0.0], 10, &by_collection, VectorSearchParams::new(100))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, alice_doc);

        let stats = store.get_stats(Some(collection_id)).await.unwrap();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, 1);
    }

    #[tokio::test]
    async fn test_metadata_filter_reaches_beyond_nearest_neighbors() {
        let store = store();
        let doc_id = insert_doc(&store, None).await;

        // Similarity falls with i; only the 5th nearest is tagged "en"
        let chunks: Vec<Chunk> = (0..6)
            .map(|i| {
                let lang = if i == 4 { "en" } else { "de" };
                Chunk::new(doc_id, i, &format!("release notes part {}", i), vec![1.0, 0.1 * i as f32, 0.0, 0.0])
                    .with_metadata("lang", json!(lang))
            })
            .collect();
        let tagged = chunks[4].id;
        store.insert_chunks(&chunks).await.unwrap();

        let mut filter = SearchFilter::default();
        filter.metadata.insert("lang".to_string(), json!("en"));

        let hits = store
            .search_by_vector(
                &[1.0, 0.0, 0.0, 0.0],
                1,
                &filter,
                VectorSearchParams::new(100).with_threshold(0.7),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, tagged);

        let hits = store.search_by_keywords("release notes", 1, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, tagged);
        assert_eq!(hits[0].rank, 1);
    }

    #[tokio::test]
    async fn test_orphaned_vectors_do_not_shrink_results() {
        let store = store();
        let kept = insert_doc(&store, None).await;
        let dropped = insert_doc(&store, None).await;
        store
            .insert_chunks(&[
                Chunk::new(dropped, 0, "orphan a", vec![1.0, 0.0, 0.0, 0.0]),
                Chunk::new(dropped, 1, "orphan b", vec![1.0, 0.05, 0.0, 0.0]),
                Chunk::new(kept, 0, "live a", vec![1.0, 0.5, 0.0, 0.0]),
                Chunk::new(kept, 1, "live b", vec![0.0, 1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        store
            .with_conn(move |conn| {
                conn.execute_batch(&format!(
                    "PRAGMA foreign_keys = OFF; DELETE FROM documents WHERE id = '{}'; PRAGMA foreign_keys = ON;",
                    dropped
                ))
                .map_err(|e| RagError::database(e.to_string()))
            })
            .await
            .unwrap();

        // The two nearest vectors belong to the deleted document
        let hits = store
            .search_by_vector(&[1.0, 0.0, 0.0, 0.0], 2, &SearchFilter::default(), VectorSearchParams::new(100))
            .await
            .unwrap();

        let contents: Vec<&str> = hits.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["live a", "live b"]);
    }

    #[tokio::test]
    async fn test_keyword_search_matches_any_term() {
        let store = store();
        let doc_id = insert_doc(&store, None).await;
        store
            .insert_chunks(&[
                Chunk::new(doc_id, 0, "Postgres vector indexes use HNSW graphs", vec![1.0; DIM]),
                Chunk::new(doc_id, 1, "Keyword search ranks with BM25", vec![1.0; DIM]),
                Chunk::new(doc_id, 2, "Unrelated gardening notes", vec![1.0; DIM]),
            ])
            .await
            .unwrap();

        let hits = store
            .search_by_keywords("the HNSW and BM25", 10, &SearchFilter::default())
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| !h.content.contains("gardening")));
        assert_eq!(hits[0].rank, 1);
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn test_keyword_search_rejects_stopword_queries() {
        let store = store();
        for query in ["", "   ", "the and of", "?!"] {
            let err = store
                .search_by_keywords(query, 10, &SearchFilter::default())
                .await
                .unwrap_err();
            assert!(matches!(err, RagError::InvalidQuery { .. }), "query {:?}", query);
        }
    }

    #[tokio::test]
    async fn test_remove_orphaned_chunks() {
        let store = store();
        let kept = insert_doc(&store, None).await;
        let dropped = insert_doc(&store, None).await;
        store
            .insert_chunks(&[
                Chunk::new(kept, 0, "kept", vec![1.0, 0.0, 0.0, 0.0]),
                Chunk::new(dropped, 0, "orphan a", vec![0.0, 1.0, 0.0, 0.0])
                    .with_metadata("lang", json!("en")),
                Chunk::new(dropped, 1, "orphan b", vec![0.0, 0.0, 1.0, 0.0]),
            ])
            .await
            .unwrap();

        // Simulate a deletion path that bypassed the cascade
        store
            .with_conn(move |conn| {
                conn.execute_batch(&format!(
                    "PRAGMA foreign_keys = OFF; DELETE FROM documents WHERE id = '{}'; PRAGMA foreign_keys = ON;",
                    dropped
                ))
                .map_err(|e| RagError::database(e.to_string()))
            })
            .await
            .unwrap();

        assert_eq!(store.remove_orphaned_chunks().await.unwrap(), 2);
        assert_eq!(store.remove_orphaned_chunks().await.unwrap(), 0);
        assert_eq!(store.indexed_vectors(), 1);
        assert_eq!(store.get_stats(None).await.unwrap().chunks, 1);
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_vector_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ragfuse.db");
        let config = test_config();

        let chunk_id = {
            let store = SqliteStore::open(&path, &config).unwrap();
            let doc_id = insert_doc(&store, None).await;
            let chunk = Chunk::new(doc_id, 0, "persisted", vec![0.0, 0.0, 0.0, 1.0]);
            let id = chunk.id;
            store.insert_chunks(&[chunk]).await.unwrap();
            id
        };

        let store = SqliteStore::open(&path, &config).unwrap();
        assert_eq!(store.indexed_vectors(), 1);
        let hits = store
            .search_by_vector(&[0.0, 0.0, 0.0, 1.0], 1, &SearchFilter::default(), VectorSearchParams::new(100))
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, chunk_id);
    }

    #[test]
    fn test_fts5_match_expression() {
        assert_eq!(
            fts5_match_expression("What is Reciprocal-Rank fusion?").unwrap(),
            "\"reciprocal\" OR \"rank\" OR \"fusion\""
        );
        assert_eq!(fts5_match_expression("rust RUST Rust").unwrap(), "\"rust\"");
        assert!(fts5_match_expression("to be or not to be").is_err());
    }
}
