use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::error;
use tracing_subscriber::EnvFilter;

use lattice::cache::{EmbeddingCache, QueryCache};
use lattice::config::Config;
use lattice::engine::{QueryEngine, QueryOptions};
use lattice::federated::{AnalyticsBridge, FederatedBridge, FederatedExecutor};
use lattice::indexer::Indexer;
use lattice::models::Document;
use lattice::ranking::Ranker;
use lattice::router::ShardRouter;
use lattice::server::{self, AppState};
use lattice::store::{BloomFilterManager, ConnectionPool};
use lattice::strategy::IndexStrategy;

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_STORAGE_ERROR: i32 = 2;

#[derive(Parser)]
#[command(
    name = "lattice",
    about = "A sharded hybrid document search engine with pluggable vector indexes",
    version
)]
struct Cli {
    /// Path to an optional TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve,

    /// Create the storage layout and routing database
    Init,

    /// Index a document from a file (id defaults to the file stem)
    Index {
        /// File whose contents become the document text
        file: PathBuf,

        /// Document id
        #[arg(long)]
        id: Option<String>,
    },

    /// Search indexed documents
    Search {
        /// Query text
        query: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// List shards
    Shards,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let system = match System::start(config.clone()).await {
        Ok(system) => system,
        Err(e) => {
            error!("storage initialization failed: {e:#}");
            std::process::exit(EXIT_STORAGE_ERROR);
        }
    };

    let result = match cli.command {
        Commands::Serve => {
            let router = system.router.clone();
            tokio::spawn(router.maintenance_loop(Duration::from_secs(600)));
            server::run(system.state(), config.port).await
        }
        Commands::Init => {
            println!("initialized storage at {}", config.storage_path.display());
            Ok(())
        }
        Commands::Index { file, id } => run_index(&system, file, id).await,
        Commands::Search { query, limit } => run_search(&system, &query, limit).await,
        Commands::Shards => run_shards(&system).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// All long-lived handles wired together from configuration.
struct System {
    router: Arc<ShardRouter>,
    engine: Arc<QueryEngine>,
    indexer: Arc<Indexer>,
    federated: Arc<FederatedExecutor>,
    bridge: Arc<FederatedBridge>,
}

impl System {
    async fn start(config: Arc<Config>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.storage_path)?;

        let pools = Arc::new(ConnectionPool::new(5));
        let blooms = Arc::new(BloomFilterManager::new());
        let router = Arc::new(ShardRouter::open(config.clone(), pools, blooms.clone()).await?);

        let strategy = match lattice::snapshot::load_latest(
            &config.index_strategy,
            &config.snapshot_dir(),
        ) {
            Ok(Some(restored)) => restored,
            _ => IndexStrategy::create(&config.index_strategy, &config).await?,
        };
        let strategy = Arc::new(RwLock::new(strategy));

        let embed_ttl = match config.cache.embedding_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let embed_cache = Arc::new(EmbeddingCache::with_ttl(
            config.cache.embedding_capacity,
            embed_ttl,
        ));
        let query_cache = Arc::new(QueryCache::new(
            config.cache.request_capacity,
            Duration::from_secs(config.cache.request_ttl_secs),
        ));

        let federated_timeout = Duration::from_millis(config.query.federated_timeout_ms);
        let federated = Arc::new(FederatedExecutor::new(router.clone(), federated_timeout));
        let bridge = Arc::new(FederatedBridge::new(router.clone(), federated_timeout));
        bridge.refresh().await?;

        let indexer = Arc::new(Indexer::new(
            config.clone(),
            strategy.clone(),
            router.clone(),
            embed_cache.clone(),
            blooms,
        ));
        let engine = Arc::new(QueryEngine::new(
            config,
            strategy,
            router.clone(),
            embed_cache,
            query_cache,
            Ranker::default(),
        ));

        Ok(Self {
            router,
            engine,
            indexer,
            federated,
            bridge,
        })
    }

    fn state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
            indexer: self.indexer.clone(),
            federated: self.federated.clone(),
            bridge: self.bridge.clone(),
        }
    }
}

async fn run_index(system: &System, file: PathBuf, id: Option<String>) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&file)?;
    let id = id.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string())
    });

    let receipt = system
        .indexer
        .index_document(Document {
            id,
            text,
            metadata: serde_json::json!({}),
        })
        .await?;
    println!("indexed {} into {}", receipt.id, receipt.shard_id);
    Ok(())
}

async fn run_search(system: &System, query: &str, limit: u32) -> anyhow::Result<()> {
    let opts = QueryOptions {
        limit: Some(limit),
        ..QueryOptions::default()
    };
    let results = system.engine.execute_query(query, &opts).await?;
    for (i, r) in results.iter().enumerate() {
        println!(
            "{:2}. {:<40} score={:.4} sim={:.4}",
            i + 1,
            r.id,
            r.final_score,
            r.similarity
        );
    }
    if results.is_empty() {
        println!("no results");
    }
    Ok(())
}

async fn run_shards(system: &System) -> anyhow::Result<()> {
    let shards = system.router.list_all_shards().await;
    for s in &shards {
        println!(
            "{:<44} docs={:<8} queries={}",
            s.id, s.doc_count, s.query_count
        );
    }
    println!("{} shard(s)", shards.len());
    Ok(())
}
