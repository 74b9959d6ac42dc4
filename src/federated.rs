//! Federated SQL execution across shards.
//!
//! [`FederatedExecutor::execute`] fans one prepared statement across every
//! shard in parallel under a deadline and concatenates the successful row
//! sets. Failed or timed-out shards contribute nothing; callers that need
//! to see the holes use [`execute_with_metadata`], which reports
//! `{shard_id, rows, status, reason}` per shard. The
//! [`AnalyticsBridge`] trait is the seam to a columnar engine for the
//! warm analytics path; the shipped implementation federates over the
//! same shard files.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{LatticeError, Result};
use crate::models::ShardInfo;
use crate::router::ShardRouter;

/// Per-shard outcome of a federated statement.
#[derive(Debug, Clone, Serialize)]
pub struct ShardQueryStatus {
    pub shard_id: String,
    pub rows: usize,
    /// `ok`, `error`, or `timeout`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct FederatedExecutor {
    router: Arc<ShardRouter>,
    timeout: Duration,
}

impl FederatedExecutor {
    pub fn new(router: Arc<ShardRouter>, timeout: Duration) -> Self {
        Self { router, timeout }
    }

    /// Run `sql` on every shard; successful shards' rows concatenated.
    ///
    /// Fails only when shards exist and every one of them failed.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>> {
        let (rows, statuses) = self.execute_with_metadata(sql, params).await?;
        if !statuses.is_empty() && statuses.iter().all(|s| s.status != "ok") {
            return Err(LatticeError::ShardUnavailable(
                "every shard failed the federated statement".to_string(),
            ));
        }
        Ok(rows)
    }

    /// Like [`execute`](Self::execute), but always succeeds and reports
    /// the per-shard status alongside the concatenated rows.
    pub async fn execute_with_metadata(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<(Vec<serde_json::Value>, Vec<ShardQueryStatus>)> {
        let shards = self.router.list_all_shards().await;

        let tasks = shards.iter().map(|shard| {
            let sql = sql.to_string();
            let params = params.to_vec();
            async move {
                let outcome =
                    tokio::time::timeout(self.timeout, self.run_on_shard(shard, &sql, &params))
                        .await;
                match outcome {
                    Ok(Ok(rows)) => (
                        rows.clone(),
                        ShardQueryStatus {
                            shard_id: shard.id.clone(),
                            rows: rows.len(),
                            status: "ok".to_string(),
                            reason: None,
                        },
                    ),
                    Ok(Err(e)) => {
                        warn!(shard = %shard.id, error = %e, "federated statement failed");
                        (
                            Vec::new(),
                            ShardQueryStatus {
                                shard_id: shard.id.clone(),
                                rows: 0,
                                status: "error".to_string(),
                                reason: Some(e.to_string()),
                            },
                        )
                    }
                    Err(_) => {
                        warn!(shard = %shard.id, timeout = ?self.timeout, "federated statement timed out");
                        (
                            Vec::new(),
                            ShardQueryStatus {
                                shard_id: shard.id.clone(),
                                rows: 0,
                                status: "timeout".to_string(),
                                reason: Some(format!("exceeded {:?}", self.timeout)),
                            },
                        )
                    }
                }
            }
        });

        let mut rows = Vec::new();
        let mut statuses = Vec::new();
        for (shard_rows, status) in join_all(tasks).await {
            rows.extend(shard_rows);
            statuses.push(status);
        }
        Ok((rows, statuses))
    }

    async fn run_on_shard(
        &self,
        shard: &ShardInfo,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>> {
        let store = self.router.store_for(shard).await?;

        let mut query = sqlx::query(sql);
        for p in params {
            query = match p {
                serde_json::Value::Null => query.bind(None::<String>),
                serde_json::Value::Bool(b) => query.bind(*b as i64),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        query.bind(i)
                    } else {
                        query.bind(n.as_f64().unwrap_or(0.0))
                    }
                }
                other => query.bind(other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string())),
            };
        }

        let rows = query.fetch_all(store.pool()).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    /// Canonical aggregate: sum of `SELECT count(*)` across shards.
    pub async fn count(&self, table: &str) -> Result<i64> {
        if !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || table.is_empty()
        {
            return Err(LatticeError::InvalidInput(format!(
                "invalid table name: {table}"
            )));
        }

        let rows = self
            .execute(&format!("SELECT count(*) AS n FROM {table}"), &[])
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get("n").and_then(|v| v.as_i64()))
            .sum())
    }
}

/// Decode a SQLite row into a JSON object, dispatching on the declared
/// column type (BLOBs render as hex).
fn row_to_json(row: &SqliteRow) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_raw(i) {
            Ok(raw) if raw.is_null() => serde_json::Value::Null,
            Ok(raw) => match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => row
                    .try_get::<i64, _>(i)
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null),
                "REAL" => row
                    .try_get::<f64, _>(i)
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null),
                "BLOB" => row
                    .try_get::<Vec<u8>, _>(i)
                    .map(|b| serde_json::Value::from(hex::encode(b)))
                    .unwrap_or(serde_json::Value::Null),
                _ => row
                    .try_get::<String, _>(i)
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null),
            },
            Err(_) => serde_json::Value::Null,
        };
        map.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(map)
}

/// Seam to the columnar analytics engine behind `/api/analytics`.
#[async_trait]
pub trait AnalyticsBridge: Send + Sync {
    /// Run an analytical statement on the warm path.
    async fn query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>>;

    /// Re-attach the current shard list; returns how many are attached.
    async fn refresh(&self) -> Result<usize>;

    /// Number of shards currently attached.
    fn shard_count(&self) -> usize;
}

/// Bridge implementation that federates over the shard SQLite files.
pub struct FederatedBridge {
    executor: FederatedExecutor,
    router: Arc<ShardRouter>,
    attached: AtomicUsize,
}

impl FederatedBridge {
    pub fn new(router: Arc<ShardRouter>, timeout: Duration) -> Self {
        Self {
            executor: FederatedExecutor::new(router.clone(), timeout),
            router,
            attached: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AnalyticsBridge for FederatedBridge {
    async fn query(
        &self,
        sql: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>> {
        self.executor.execute(sql, params).await
    }

    async fn refresh(&self) -> Result<usize> {
        let n = self.router.shard_count().await;
        self.attached.store(n, Ordering::Relaxed);
        Ok(n)
    }

    fn shard_count(&self) -> usize {
        self.attached.load(Ordering::Relaxed)
    }
}
