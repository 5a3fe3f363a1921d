//! ragfuse CLI - Command-line interface for the hybrid retrieval engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use ulid::Ulid;

use ragfuse_core::{Chunk, Document, DocumentStatus, DocumentStore, Metadata, RagConfig};
use ragfuse_query::{
    ConsistencyReconciler, EngineConfig, FilteredSearchRequest, HybridSearchRequest,
    KeywordSearchRequest, QueryEngine, SimilarChunksRequest,
};
use ragfuse_store::SqliteStore;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// ragfuse - Hybrid vector and keyword retrieval over a local database
#[derive(Parser)]
#[command(name = "ragfuse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database path (default: from config, else the local data directory)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    /// Config file (default: user config dir, then ./ragfuse.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Import a document and its embedded chunks from a JSON file
    Import {
        /// JSON file with `filename`, `chunks[{content, embedding, metadata}]`
        file: PathBuf,
    },

    /// Hybrid vector + keyword search
    Hybrid {
        /// Search query
        query: String,

        /// JSON file holding the query embedding as an array of floats
        #[arg(short, long)]
        embedding: PathBuf,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        match_count: Option<usize>,

        /// Weight of the keyword ranking, 0 to 1
        #[arg(short = 'w', long)]
        keyword_weight: Option<f32>,

        /// Restrict to a collection
        #[arg(long)]
        collection: Option<Ulid>,

        /// Restrict to documents owned by a user
        #[arg(long)]
        user: Option<Ulid>,
    },

    /// Pure vector search above a similarity threshold
    Similar {
        /// JSON file holding the query embedding as an array of floats
        #[arg(short, long)]
        embedding: PathBuf,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        match_count: Option<usize>,

        /// Minimum similarity (exclusive)
        #[arg(short, long)]
        threshold: Option<f32>,

        /// Required chunk metadata as key=value (value parsed as JSON when possible)
        #[arg(short, long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, serde_json::Value)>,

        /// Restrict to a collection
        #[arg(long)]
        collection: Option<Ulid>,

        /// Restrict to documents owned by a user
        #[arg(long)]
        user: Option<Ulid>,
    },

    /// Keyword-only search
    Keyword {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(short = 'k', long)]
        match_count: Option<usize>,

        /// Restrict to a collection
        #[arg(long)]
        collection: Option<Ulid>,

        /// Restrict to documents owned by a user
        #[arg(long)]
        user: Option<Ulid>,
    },

    /// Remove chunks whose document no longer exists
    Reconcile {
        /// Keep running on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
    },

    /// Show statistics
    Stats {
        /// Collection to get stats for (all if not specified)
        #[arg(long)]
        collection: Option<Ulid>,
    },

    /// Delete a document and its chunks
    DeleteDocument {
        /// Document id
        id: Ulid,
    },
}

/// Document import file layout.
#[derive(Debug, Deserialize)]
struct ImportDocument {
    filename: String,
    #[serde(default)]
    user_id: Option<Ulid>,
    #[serde(default)]
    collection_id: Option<Ulid>,
    #[serde(default)]
    metadata: Metadata,
    chunks: Vec<ImportChunk>,
}

#[derive(Debug, Deserialize)]
struct ImportChunk {
    content: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Serialize)]
struct ImportSummary {
    document_id: Ulid,
    chunks: usize,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config(path: Option<&Path>) -> CliResult<RagConfig> {
    let config = match path {
        Some(path) => RagConfig::load(path)?,
        None => RagConfig::load_default()?,
    };
    Ok(config)
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", s))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn read_embedding(path: &Path) -> CliResult<Vec<f32>> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store(db_path: &Path, config: &RagConfig) -> CliResult<Arc<SqliteStore>> {
    if !db_path.exists() {
        eprintln!(
            "Database does not exist. Run 'ragfuse init' first, or specify a path with -d."
        );
        std::process::exit(1);
    }

    Ok(Arc::new(SqliteStore::open(db_path, config)?))
}

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let db_path = cli.database.unwrap_or_else(|| config.database.path.clone());

    if let Commands::Init = cli.command {
        SqliteStore::open(&db_path, &config)?;
        println!("Initialized database at: {}", db_path.display());
        return Ok(());
    }

    let store = open_store(&db_path, &config)?;
    let engine = QueryEngine::new(
        Arc::clone(&store),
        Arc::clone(&store),
        EngineConfig::from(&config),
    );

    match cli.command {
        Commands::Init => {}
        Commands::Import { file } => {
            let summary = import(&store, &file).await?;
            print_json(&summary)?;
        }
        Commands::Hybrid {
            query,
            embedding,
            match_count,
            keyword_weight,
            collection,
            user,
        } => {
            let request = HybridSearchRequest {
                match_count,
                keyword_weight,
                filter_collection_id: collection,
                filter_user_id: user,
                ..HybridSearchRequest::new(query, read_embedding(&embedding)?)
            };
            print_json(&engine.hybrid_search(request).await?)?;
        }
        Commands::Similar {
            embedding,
            match_count,
            threshold,
            filters,
            collection,
            user,
        } => {
            let query_embedding = read_embedding(&embedding)?;
            let results = if filters.is_empty() {
                engine
                    .search_similar_chunks(SimilarChunksRequest {
                        match_threshold: threshold,
                        match_count,
                        filter_collection_id: collection,
                        filter_user_id: user,
                        ..SimilarChunksRequest::new(query_embedding)
                    })
                    .await?
            } else {
                engine
                    .filtered_semantic_search(FilteredSearchRequest {
                        query_embedding,
                        metadata: filters.into_iter().collect(),
                        match_threshold: threshold,
                        match_count,
                        filter_collection_id: collection,
                        filter_user_id: user,
                        timeout: None,
                    })
                    .await?
            };
            print_json(&results)?;
        }
        Commands::Keyword {
            query,
            match_count,
            collection,
            user,
        } => {
            let request = KeywordSearchRequest {
                query_text: query,
                match_count,
                filter_collection_id: collection,
                filter_user_id: user,
                timeout: None,
            };
            print_json(&engine.keyword_search(request).await?)?;
        }
        Commands::Reconcile { watch } => {
            let reconciler = ConsistencyReconciler::new(Arc::clone(&store));
            if watch {
                let interval = Duration::from_secs(config.reconcile.interval_secs.max(1));
                info!("Reconciling every {}s", interval.as_secs());
                let handle = reconciler.spawn(interval);
                tokio::signal::ctrl_c().await?;
                handle.abort();
            } else {
                let removed = reconciler.run_once().await?;
                println!("Removed {} orphaned chunks", removed);
            }
        }
        Commands::Stats { collection } => {
            print_json(&store.get_stats(collection).await?)?;
        }
        Commands::DeleteDocument { id } => {
            store.delete_document(id).await?;
            println!("Deleted document {}", id);
        }
    }

    Ok(())
}

async fn import(store: &SqliteStore, file: &Path) -> CliResult<ImportSummary> {
    let content = fs::read_to_string(file)?;
    let input: ImportDocument = serde_json::from_str(&content)?;

    let mut doc = Document::new(&input.filename, input.user_id);
    doc.metadata = input.metadata;
    let document_id = doc.id;

    store.insert_document(doc).await?;
    store
        .update_document_status(document_id, DocumentStatus::Processing)
        .await?;

    let chunks: Vec<Chunk> = input
        .chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let mut chunk = Chunk::new(document_id, i as u32, &c.content, c.embedding);
            chunk.metadata = c.metadata;
            chunk
        })
        .collect();

    if let Err(e) = store.insert_chunks(&chunks).await {
        store
            .update_document_status(document_id, DocumentStatus::Failed)
            .await?;
        return Err(e.into());
    }

    if let Some(collection_id) = input.collection_id {
        store
            .add_document_to_collection(collection_id, document_id)
            .await?;
    }

    store
        .update_document_status(document_id, DocumentStatus::Completed)
        .await?;

    info!("Imported {} with {} chunks", input.filename, chunks.len());

    Ok(ImportSummary {
        document_id,
        chunks: chunks.len(),
    })
}
