//! HTTP API (Axum).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check |
//! | `POST` | `/api/search` | Hot-path search |
//! | `POST` | `/api/search/hybrid` | Search + SQL predicate |
//! | `POST` | `/api/search/grounded` | Search at paragraph/sentence level with provenance |
//! | `POST` | `/api/query` | Federated SQL across shards |
//! | `POST` | `/api/analytics` | Warm-path analytics through the bridge |
//! | `POST` | `/api/documents` | Index one document or a batch |
//! | `DELETE` | `/api/documents/{id}` | Delete a document |
//! | `GET` | `/api/shards` | Shard listing |
//! | `POST` | `/api/admin/refresh-duckdb` | Re-attach shards to the analytics bridge |
//! | `POST` | `/api/admin/clear-cache` | Reset embedding and request caches |
//! | `GET` | `/api/metrics` | Cache and shard counters |
//!
//! Invalid input answers 400, internal failures 500 with a stringified
//! reason. Degraded (partial) search results are still 200; clients
//! watch `/api/metrics` for trouble. A search whose query text looks like
//! SQL is transparently routed to the warm analytics path.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::cache::CacheMetrics;
use crate::engine::{looks_like_sql, QueryEngine, QueryOptions};
use crate::error::LatticeError;
use crate::federated::{AnalyticsBridge, FederatedExecutor};
use crate::indexer::Indexer;
use crate::models::{Candidate, ChunkLevel, Document};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryEngine>,
    pub indexer: Arc<Indexer>,
    pub federated: Arc<FederatedExecutor>,
    pub bridge: Arc<dyn AnalyticsBridge>,
}

/// Build the router with every endpoint and permissive CORS.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/search", post(handle_search))
        .route("/api/search/hybrid", post(handle_hybrid))
        .route("/api/search/grounded", post(handle_grounded))
        .route("/api/query", post(handle_query))
        .route("/api/analytics", post(handle_analytics))
        .route("/api/documents", post(handle_index))
        .route("/api/documents/{id}", delete(handle_delete))
        .route("/api/shards", get(handle_shards))
        .route("/api/admin/refresh-duckdb", post(handle_refresh))
        .route("/api/admin/clear-cache", post(handle_clear_cache))
        .route("/api/metrics", get(handle_metrics))
        .layer(cors)
        .with_state(state)
}

/// Serve until the process is terminated.
pub async fn run(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = app(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error mapping ============

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<LatticeError> for AppError {
    fn from(e: LatticeError) -> Self {
        let status = match &e {
            LatticeError::InvalidInput(_) | LatticeError::DimensionMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "invalid_input".to_string(),
        message: message.into(),
    }
}

// ============ Handlers ============

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!("ok"))
}

#[derive(Deserialize)]
struct SearchBody {
    query: Option<String>,
    limit: Option<u32>,
    min_similarity: Option<f32>,
    shard_limit: Option<u32>,
    #[serde(rename = "where")]
    where_clause: Option<String>,
    level: Option<String>,
    force_engine: Option<String>,
}

impl SearchBody {
    fn query(&self) -> Result<&str, AppError> {
        match self.query.as_deref() {
            Some(q) if !q.trim().is_empty() => Ok(q),
            _ => Err(bad_request("query must not be empty")),
        }
    }

    fn options(&self) -> QueryOptions {
        QueryOptions {
            limit: self.limit,
            min_similarity: self.min_similarity,
            shard_limit: self.shard_limit,
            level: None,
            expand_context: false,
            force_engine: self.force_engine.clone(),
            where_clause: None,
        }
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Response, AppError> {
    let query = body.query()?;

    // SQL-looking input takes the warm path transparently.
    if looks_like_sql(query) {
        let results = state.bridge.query(query, &[]).await?;
        return Ok(Json(serde_json::json!({
            "results": results,
            "path": "warm",
            "engine": "duckdb",
        }))
        .into_response());
    }

    let results = state.engine.execute_query(query, &body.options()).await?;
    Ok(Json(serde_json::json!({ "results": results, "path": "hot" })).into_response())
}

async fn handle_hybrid(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Response, AppError> {
    let query = body.query()?;
    let mut opts = body.options();
    opts.where_clause = body.where_clause.clone();

    let results = state.engine.execute_query(query, &opts).await?;
    Ok(Json(serde_json::json!({ "results": results, "path": "hot" })).into_response())
}

#[derive(Serialize)]
struct GroundedResult<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    doc_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    similarity: f32,
    grounding: Option<&'a crate::models::Reference>,
}

async fn handle_grounded(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Response, AppError> {
    let query = body.query()?;
    let level = match body.level.as_deref() {
        Some(s) => match ChunkLevel::parse(s) {
            Some(ChunkLevel::Document) | None => {
                return Err(bad_request("level must be \"paragraph\" or \"sentence\""))
            }
            Some(l) => l,
        },
        None => ChunkLevel::Paragraph,
    };

    let mut opts = body.options();
    opts.level = Some(level);
    opts.expand_context = true;

    let results = state.engine.execute_query(query, &opts).await?;
    let rows: Vec<GroundedResult<'_>> = results
        .iter()
        .map(|c: &Candidate| GroundedResult {
            id: &c.id,
            doc_id: c.doc_id.as_deref(),
            text: c.text.as_deref(),
            similarity: c.similarity,
            grounding: c.grounding.as_ref(),
        })
        .collect();

    Ok(Json(serde_json::json!({ "results": rows, "level": level.as_str() })).into_response())
}

#[derive(Deserialize)]
struct SqlBody {
    sql: String,
    #[serde(default)]
    params: Vec<serde_json::Value>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(body): Json<SqlBody>,
) -> Result<Response, AppError> {
    let results = state.federated.execute(&body.sql, &body.params).await?;
    Ok(Json(serde_json::json!({ "results": results })).into_response())
}

async fn handle_analytics(
    State(state): State<AppState>,
    Json(body): Json<SqlBody>,
) -> Result<Response, AppError> {
    let results = state.bridge.query(&body.sql, &body.params).await?;
    Ok(Json(serde_json::json!({
        "results": results,
        "path": "warm",
        "engine": "duckdb",
    }))
    .into_response())
}

#[derive(Deserialize)]
struct IndexBody {
    id: Option<String>,
    text: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
    documents: Option<Vec<Document>>,
}

async fn handle_index(
    State(state): State<AppState>,
    Json(body): Json<IndexBody>,
) -> Result<Response, AppError> {
    if let Some(docs) = body.documents {
        if docs.is_empty() {
            return Err(bad_request("documents must not be empty"));
        }
        let receipts = state.indexer.index_documents(docs).await?;
        return Ok((StatusCode::CREATED, Json(serde_json::json!({ "results": receipts })))
            .into_response());
    }

    let (Some(id), Some(text)) = (body.id, body.text) else {
        return Err(bad_request("id and text are required"));
    };
    let receipt = state
        .indexer
        .index_document(Document {
            id,
            text,
            metadata: body.metadata,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)).into_response())
}

async fn handle_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    state.indexer.delete_document(&id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted", "id": id })).into_response())
}

async fn handle_shards(State(state): State<AppState>) -> impl IntoResponse {
    let shards = state.engine.router().list_all_shards().await;
    let rows: Vec<serde_json::Value> = shards
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "path": s.path,
                "doc_count": s.doc_count,
                "query_count": s.query_count,
            })
        })
        .collect();
    Json(serde_json::json!({ "shards": rows, "count": shards.len() }))
}

async fn handle_refresh(State(state): State<AppState>) -> Result<Response, AppError> {
    let attached = state.bridge.refresh().await?;
    Ok(Json(serde_json::json!({ "status": "ok", "attached": attached })).into_response())
}

async fn handle_clear_cache(State(state): State<AppState>) -> impl IntoResponse {
    state.engine.embed_cache().reset_state();
    state.engine.query_cache().clear();
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let CacheMetrics { hits, misses } = state.engine.embed_cache().metrics();
    let shard_count = state.engine.router().shard_count().await;
    Json(serde_json::json!({
        "cache_hits": hits,
        "cache_misses": misses,
        "shard_count": shard_count,
        "duckdb_shards": state.bridge.shard_count(),
    }))
}
