use std::sync::Arc;

use serde_json::json;
use ulid::Ulid;

use ragfuse_core::{Chunk, Document, DocumentStatus, DocumentStore, Metadata, RagConfig};
use ragfuse_query::{
    ConsistencyReconciler, EngineConfig, FilteredSearchRequest, HybridSearchRequest,
    KeywordSearchRequest, QueryEngine, SimilarChunksRequest,
};
use ragfuse_store::SqliteStore;

fn config() -> RagConfig {
    let mut config = RagConfig::default();
    config.index.dimension = 4;
    config
}

async fn seeded_store() -> (Arc<SqliteStore>, Ulid, Ulid) {
    let store = Arc::new(SqliteStore::open_memory(&config()).unwrap());

    let guide = Document::new("rust-guide.md", None);
    let notes = Document::new("garden-notes.md", None);
    let (guide_id, notes_id) = (guide.id, notes.id);
    store.insert_document(guide).await.unwrap();
    store.insert_document(notes).await.unwrap();

    store
        .insert_chunks(&[
            Chunk::new(guide_id, 0, "Ownership and borrowing rules in Rust", vec![1.0, 0.0, 0.0, 0.0])
                .with_metadata("section", json!("basics")),
            Chunk::new(guide_id, 1, "Async runtimes schedule futures on worker threads", vec![0.8, 0.6, 0.0, 0.0])
                .with_metadata("section", json!("async")),
            Chunk::new(guide_id, 2, "Reciprocal rank fusion merges ranked lists", vec![0.0, 1.0, 0.0, 0.0])
                .with_metadata("section", json!("search")),
        ])
        .await
        .unwrap();
    store
        .insert_chunks(&[Chunk::new(
            notes_id,
            0,
            "Tomatoes need full sun and regular watering",
            vec![0.0, 0.0, 1.0, 0.0],
        )])
        .await
        .unwrap();

    for id in [guide_id, notes_id] {
        store
            .update_document_status(id, DocumentStatus::Processing)
            .await
            .unwrap();
        store
            .update_document_status(id, DocumentStatus::Completed)
            .await
            .unwrap();
    }

    (store, guide_id, notes_id)
}

fn engine(store: &Arc<SqliteStore>) -> QueryEngine<SqliteStore, SqliteStore> {
    QueryEngine::new(Arc::clone(store), Arc::clone(store), EngineConfig::from(&config()))
}

#[tokio::test]
async fn hybrid_search_combines_vector_and_keyword_rankings() {
    let (store, guide_id, _) = seeded_store().await;
    let engine = engine(&store);

    let results = engine
        .hybrid_search(HybridSearchRequest {
            match_count: Some(3),
            ..HybridSearchRequest::new("rank fusion", vec![0.1, 1.0, 0.0, 0.0])
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].content, "Reciprocal rank fusion merges ranked lists");
    assert_eq!(results[0].document_id, guide_id);
    assert!(results[0].keyword_score > 0.0);
    assert!(results[0].vector_score > 0.9);
    assert!(results
        .windows(2)
        .all(|w| w[0].combined_score >= w[1].combined_score));
}

#[tokio::test]
async fn similar_chunks_respects_threshold() {
    let (store, _, _) = seeded_store().await;
    let engine = engine(&store);

    let results = engine
        .search_similar_chunks(SimilarChunksRequest::new(vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();

    // 1.0 for the exact match, 0.8 for the async chunk, 0.0 for the rest
    let contents: Vec<&str> = results.iter().map(|r| r.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "Ownership and borrowing rules in Rust",
            "Async runtimes schedule futures on worker threads",
        ]
    );
}

#[tokio::test]
async fn filtered_semantic_search_matches_metadata() {
    let (store, _, _) = seeded_store().await;
    let engine = engine(&store);

    let mut metadata = Metadata::new();
    metadata.insert("section".to_string(), json!("async"));

    let results = engine
        .filtered_semantic_search(FilteredSearchRequest {
            query_embedding: vec![1.0, 0.0, 0.0, 0.0],
            metadata,
            match_count: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].metadata["section"], json!("async"));
}

#[tokio::test]
async fn hybrid_search_with_huge_match_count_keeps_both_sources() {
    let (store, _, _) = seeded_store().await;
    let engine = engine(&store);

    let results = engine
        .hybrid_search(HybridSearchRequest {
            match_count: Some(usize::MAX / 2),
            ..HybridSearchRequest::new("ownership borrowing", vec![1.0, 0.0, 0.0, 0.0])
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].content, "Ownership and borrowing rules in Rust");
    assert!(results[0].vector_score > 0.99);
    assert!(results[0].keyword_score > 0.0);
}

#[tokio::test]
async fn filtered_semantic_search_reaches_past_oversampled_pool() {
    let store = Arc::new(SqliteStore::open_memory(&config()).unwrap());
    let doc = Document::new("changelog.md", None);
    let doc_id = doc.id;
    store.insert_document(doc).await.unwrap();

    let chunks: Vec<Chunk> = (0..6u32)
        .map(|i| {
            let lang = if i == 4 { "en" } else { "de" };
            Chunk::new(doc_id, i, "changelog entry", vec![1.0, 0.1 * i as f32, 0.0, 0.0])
                .with_metadata("lang", json!(lang))
        })
        .collect();
    let tagged = chunks[4].id;
    store.insert_chunks(&chunks).await.unwrap();

    let mut metadata = Metadata::new();
    metadata.insert("lang".to_string(), json!("en"));

    let results = engine(&store)
        .filtered_semantic_search(FilteredSearchRequest {
            query_embedding: vec![1.0, 0.0, 0.0, 0.0],
            metadata,
            match_count: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, tagged);
}

#[tokio::test]
async fn deleted_documents_never_surface_after_reconciliation() {
    let (store, guide_id, notes_id) = seeded_store().await;
    let engine = engine(&store);

    store.delete_document(notes_id).await.unwrap();
    let removed = ConsistencyReconciler::new(Arc::clone(&store))
        .run_once()
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let results = engine
        .hybrid_search(HybridSearchRequest::new(
            "tomatoes sun watering",
            vec![0.0, 0.0, 1.0, 0.0],
        ))
        .await
        .unwrap();

    assert!(!results.is_empty());
    for result in &results {
        assert_eq!(result.document_id, guide_id);
        assert!(store.get_document(result.document_id).await.unwrap().is_some());
    }

    let keyword_hits = engine
        .keyword_search(KeywordSearchRequest {
            query_text: "tomatoes".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(keyword_hits.is_empty());

    let stats = store.get_stats(None).await.unwrap();
    assert_eq!(stats.documents, 1);
    assert_eq!(stats.chunks, 3);
    assert_eq!(stats.indexed_vectors, 3);
}
