//! End-to-end scenarios across the strategy, routing, federated, and HTTP
//! layers. Each test builds an isolated system under a temp directory.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use lattice::cache::{EmbeddingCache, QueryCache};
use lattice::config::Config;
use lattice::engine::QueryEngine;
use lattice::federated::{AnalyticsBridge, FederatedBridge, FederatedExecutor};
use lattice::indexer::Indexer;
use lattice::models::Document;
use lattice::ranking::Ranker;
use lattice::router::ShardRouter;
use lattice::server::{self, AppState};
use lattice::store::{BloomFilterManager, ConnectionPool};
use lattice::strategy::{FindOptions, IndexStrategy};

fn test_config(storage: &std::path::Path, dim: usize) -> Arc<Config> {
    Arc::new(Config {
        storage_path: storage.to_path_buf(),
        embedding_dim: dim,
        ..Config::default()
    })
}

async fn open_router(config: Arc<Config>) -> Arc<ShardRouter> {
    let pools = Arc::new(ConnectionPool::new(4));
    let blooms = Arc::new(BloomFilterManager::new());
    Arc::new(ShardRouter::open(config, pools, blooms).await.unwrap())
}

/// Scenario: centroid search over explicit vectors.
#[tokio::test]
async fn centroid_search_prefers_exact_match() {
    let config = Config {
        embedding_dim: 4,
        ..Config::default()
    };
    let mut strategy = IndexStrategy::create("centroid", &config).await.unwrap();

    strategy
        .index_document("doc1", serde_json::Value::Null, &[0.1, 0.2, 0.3, 0.4])
        .await
        .unwrap();
    strategy
        .index_document("doc2", serde_json::Value::Null, &[0.4, 0.3, 0.2, 0.1])
        .await
        .unwrap();

    let results = strategy
        .find_candidates(&[0.1, 0.2, 0.3, 0.4], &FindOptions::with_limit(2))
        .await
        .unwrap();
    assert_eq!(results[0].id, "doc1");
    assert!(results[0].similarity > 0.99);
}

/// Scenario: quantized cells with neighbor expansion.
#[tokio::test]
async fn quantized_cells_find_inserted_vector() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config {
        storage_path: tmp.path().to_path_buf(),
        embedding_dim: 4,
        index_strategy: "quantized".to_string(),
        ..Config::default()
    };
    config.index.bins = 4;
    config.index.dims_per_level = 2;
    config.index.cell_capacity = 100;
    config.index.search_radius = 1;

    let mut strategy = IndexStrategy::create("quantized", &config).await.unwrap();

    strategy
        .index_document("doc3", serde_json::Value::Null, &[0.2, 0.3, 0.1, 0.4])
        .await
        .unwrap();
    strategy
        .index_document("doc4", serde_json::Value::Null, &[0.4, 0.3, 0.2, 0.1])
        .await
        .unwrap();

    let results = strategy
        .find_candidates(&[0.2, 0.3, 0.1, 0.4], &FindOptions::with_limit(10))
        .await
        .unwrap();
    assert!(results.iter().any(|c| c.id == "doc3"));
}

/// Scenario: HNSW separates a target from structured noise.
#[tokio::test]
async fn hnsw_target_vs_noise() {
    let mut config = Config {
        embedding_dim: 8,
        ..Config::default()
    };
    config.index.hnsw_m = 4;
    config.index.ef_construction = 50;
    config.index.ef_search = 20;

    let mut strategy = IndexStrategy::create("hnsw", &config).await.unwrap();
    strategy
        .index_document("target", serde_json::Value::Null, &[0.5; 8])
        .await
        .unwrap();

    let noise: [[f32; 8]; 4] = [
        [1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0, -1.0],
        [-1.0, 0.0, 1.0, -1.0, 0.0, 1.0, -1.0, 0.0],
        [0.0, 1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0],
        [-1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0],
    ];
    for (i, v) in noise.iter().enumerate() {
        strategy
            .index_document(&format!("noise{i}"), serde_json::Value::Null, v)
            .await
            .unwrap();
    }

    let results = strategy
        .find_candidates(&[0.51; 8], &FindOptions::with_limit(3))
        .await
        .unwrap();
    assert_eq!(results[0].id, "target");
}

/// Scenario: binary Hamming search with a batch-trained quantizer.
#[tokio::test]
async fn binary_hamming_target_first() {
    let mut config = Config {
        embedding_dim: 64,
        ..Config::default()
    };
    config.index.binary_bits = 64;

    let mut strategy = IndexStrategy::create("binary", &config).await.unwrap();

    let mut batch = vec![(
        "target".to_string(),
        serde_json::Value::Null,
        vec![0.9f32; 64],
    )];
    for i in 0..3 {
        batch.push((
            format!("random{i}"),
            serde_json::Value::Null,
            lattice::embedding::hashed_embedding(&format!("rand-{i}"), 64),
        ));
    }
    strategy.index_batch(batch).await.unwrap();

    // similar(target, 0.01)
    let query = vec![0.91f32; 64];
    let results = strategy
        .find_candidates(&query, &FindOptions::with_limit(2))
        .await
        .unwrap();
    assert_eq!(results[0].id, "target");
}

async fn seed_counted_shards(
    router: &ShardRouter,
    counts: [usize; 3],
) -> Vec<String> {
    // Orthogonal seeds force three distinct shards (split threshold 0.5).
    let seeds = [[1.0f32, 0.0], [0.0, 1.0], [-1.0, 0.0]];
    let mut shard_ids = Vec::new();
    for (s, (&count, seed)) in counts.iter().zip(seeds.iter()).enumerate() {
        let shard = router.route_insert(seed).await.unwrap();
        let writer = router.writer_for(&shard).await.unwrap();
        for i in 0..count {
            let doc = Document {
                id: format!("s{s}-d{i}"),
                text: "Body text.".to_string(),
                metadata: serde_json::Value::Null,
            };
            let chunks = lattice::chunk::chunk_document(&doc);
            writer.insert(doc, chunks).await.unwrap();
            router.note_insert(&shard.id, seed).await.unwrap();
        }
        shard_ids.push(shard.id.clone());
    }
    shard_ids
}

/// Scenario: federated count over three shards of 10, 20, 30 documents.
#[tokio::test]
async fn federated_count_sums_to_sixty() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path(), 2);
    let router = open_router(config).await;
    seed_counted_shards(&router, [10, 20, 30]).await;

    let executor = FederatedExecutor::new(router, Duration::from_secs(30));
    let (rows, statuses) = executor
        .execute_with_metadata("SELECT count(*) AS n FROM documents", &[])
        .await
        .unwrap();

    assert_eq!(statuses.len(), 3);
    for s in &statuses {
        assert_eq!(s.status, "ok", "shard {}", s.shard_id);
    }
    let total: i64 = rows.iter().filter_map(|r| r["n"].as_i64()).sum();
    assert_eq!(total, 60);
}

/// Scenario: one shard killed mid-federated-query; the survivors answer,
/// the victim reports a timeout, the call as a whole succeeds.
#[tokio::test]
async fn federated_partial_failure_reports_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path(), 2);

    let victim_path = {
        let router = open_router(config.clone()).await;
        seed_counted_shards(&router, [5, 5, 5]).await;
        std::path::PathBuf::from(&router.list_all_shards().await[0].path)
    };

    // Kill the shard: its database path becomes unopenable, so the
    // retrying checkout burns past the executor deadline.
    std::fs::remove_file(&victim_path).unwrap();
    std::fs::create_dir_all(victim_path.join("not-a-db")).unwrap();

    let router = open_router(config).await;
    let executor = FederatedExecutor::new(router, Duration::from_millis(300));
    let (rows, statuses) = executor
        .execute_with_metadata("SELECT count(*) AS n FROM documents", &[])
        .await
        .unwrap();

    let ok: Vec<_> = statuses.iter().filter(|s| s.status == "ok").collect();
    let timed_out: Vec<_> = statuses.iter().filter(|s| s.status == "timeout").collect();
    assert_eq!(ok.len(), 2);
    assert_eq!(timed_out.len(), 1);

    let total: i64 = rows.iter().filter_map(|r| r["n"].as_i64()).sum();
    assert_eq!(total, 10);
}

async fn full_stack(tmp: &std::path::Path) -> AppState {
    let config = Arc::new(Config {
        storage_path: tmp.to_path_buf(),
        embedding_dim: 16,
        ..Config::default()
    });
    let pools = Arc::new(ConnectionPool::new(4));
    let blooms = Arc::new(BloomFilterManager::new());
    let router = Arc::new(
        ShardRouter::open(config.clone(), pools, blooms.clone())
            .await
            .unwrap(),
    );
    let strategy = Arc::new(RwLock::new(
        IndexStrategy::create("centroid", &config).await.unwrap(),
    ));
    let embed_cache = Arc::new(EmbeddingCache::new(1024));
    let query_cache = Arc::new(QueryCache::new(64, Duration::from_secs(60)));

    let federated_timeout = Duration::from_secs(30);
    let federated = Arc::new(FederatedExecutor::new(router.clone(), federated_timeout));
    let bridge = Arc::new(FederatedBridge::new(router.clone(), federated_timeout));
    bridge.refresh().await.unwrap();

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
        router,
        embed_cache,
        query_cache,
        Ranker::default(),
    ));

    AppState {
        engine,
        indexer,
        federated,
        bridge,
    }
}

/// HTTP smoke test: index, search, metrics, delete over a live listener.
#[tokio::test]
async fn http_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let state = full_stack(tmp.path()).await;
    let app = server::app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base = format!("http://{addr}");
    let client = reqwest::Client::new();

    // health
    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, serde_json::json!("ok"));

    // index one document
    let resp = client
        .post(format!("{base}/api/documents"))
        .json(&serde_json::json!({
            "id": "doc-http",
            "text": "Vectors meet SQLite. Sharding keeps things small.",
            "metadata": {"source": "http-test"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    // search finds it
    let body: serde_json::Value = client
        .post(format!("{base}/api/search"))
        .json(&serde_json::json!({
            "query": "Vectors meet SQLite. Sharding keeps things small.",
            "limit": 5
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["path"], "hot");
    let results = body["results"].as_array().unwrap();
    assert!(!results.is_empty());

    // empty query is a 400
    let resp = client
        .post(format!("{base}/api/search"))
        .json(&serde_json::json!({ "query": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // metrics reflect shard creation
    let metrics: serde_json::Value = client
        .get(format!("{base}/api/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["shard_count"], 1);

    // shard listing
    let shards: serde_json::Value = client
        .get(format!("{base}/api/shards"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(shards["count"], 1);

    // federated SQL over the hot path
    let q: serde_json::Value = client
        .post(format!("{base}/api/query"))
        .json(&serde_json::json!({ "sql": "SELECT count(*) AS n FROM documents" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let total: i64 = q["results"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["n"].as_i64())
        .sum();
    assert_eq!(total, 1);

    // analytics path labels itself
    let analytics: serde_json::Value = client
        .post(format!("{base}/api/analytics"))
        .json(&serde_json::json!({ "sql": "SELECT count(*) AS n FROM documents" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(analytics["path"], "warm");
    assert_eq!(analytics["engine"], "duckdb");

    // delete
    let deleted: serde_json::Value = client
        .delete(format!("{base}/api/documents/doc-http"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deleted["status"], "deleted");
    assert_eq!(deleted["id"], "doc-http");

    // grounded search with a bad level is a 400
    let resp = client
        .post(format!("{base}/api/search/grounded"))
        .json(&serde_json::json!({ "query": "anything", "level": "document" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

/// Grounded search returns byte-offset provenance.
#[tokio::test]
async fn grounded_search_attaches_offsets() {
    let tmp = tempfile::tempdir().unwrap();
    let state = full_stack(tmp.path()).await;

    state
        .indexer
        .index_document(Document {
            id: "essay".to_string(),
            text: "Search engines shard data. Provenance matters.\n\nSecond paragraph follows."
                .to_string(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    let opts = lattice::engine::QueryOptions {
        level: Some(lattice::models::ChunkLevel::Sentence),
        expand_context: true,
        ..Default::default()
    };
    let results = state
        .engine
        .execute_query("Provenance matters in sharded search.", &opts)
        .await
        .unwrap();

    assert!(!results.is_empty());
    let grounding = results[0].grounding.as_ref().unwrap();
    assert_eq!(grounding.doc_id, "essay");
    assert!(grounding.end_offset > grounding.start_offset);
    assert!(!grounding.parent_context.is_empty());
}

/// Request cache: the second identical query is served without touching
/// the embedding provider.
#[tokio::test]
async fn request_cache_serves_repeat_queries() {
    let tmp = tempfile::tempdir().unwrap();
    let state = full_stack(tmp.path()).await;

    state
        .indexer
        .index_document(Document {
            id: "d1".to_string(),
            text: "Cache me if you can.".to_string(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();

    let opts = lattice::engine::QueryOptions::default();
    let first = state
        .engine
        .execute_query("Cache me if you can.", &opts)
        .await
        .unwrap();
    let hits_after_first = state.engine.embed_cache().metrics().hits;

    let second = state
        .engine
        .execute_query("Cache me if you can.", &opts)
        .await
        .unwrap();

    let ids =
        |cands: &[lattice::models::Candidate]| cands.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&first), ids(&second));
    // Request-cache hit: no further embedding lookups happened.
    assert_eq!(state.engine.embed_cache().metrics().hits, hits_after_first);
}

/// `/api/admin/clear-cache` resets the embedding cache counters.
#[tokio::test]
async fn clear_cache_resets_metrics() {
    let tmp = tempfile::tempdir().unwrap();
    let state = full_stack(tmp.path()).await;

    state
        .indexer
        .index_document(Document {
            id: "d1".to_string(),
            text: "Some text.".to_string(),
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap();
    assert!(state.engine.embed_cache().metrics().misses > 0);

    state.engine.embed_cache().reset_state();
    state.engine.query_cache().clear();
    let metrics = state.engine.embed_cache().metrics();
    assert_eq!(metrics.hits, 0);
    assert_eq!(metrics.misses, 0);
}
