//! Process-wide registry of per-shard SQLite pools.
//!
//! Checkout is get-or-create keyed by the shard's database path. Opening a
//! database can fail transiently (directory being created, file locked by
//! a competing writer), so `checkout` retries with bounded exponential
//! backoff: 50 ms base, doubling, five attempts.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{LatticeError, Result};

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const MAX_ATTEMPTS: u32 = 5;

pub struct ConnectionPool {
    pools: RwLock<HashMap<PathBuf, SqlitePool>>,
    max_connections: u32,
}

impl ConnectionPool {
    pub fn new(max_connections: u32) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            max_connections: max_connections.max(1),
        }
    }

    /// Pool for the database at `path`, opening it on first use.
    ///
    /// Transient open failures are retried with exponential backoff; the
    /// final failure surfaces as `shard_unavailable`.
    pub async fn checkout(&self, path: &Path) -> Result<SqlitePool> {
        if let Some(pool) = self.pools.read().await.get(path) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(path) {
            return Ok(pool.clone());
        }

        let mut attempt = 0u32;
        let pool = loop {
            match self.open(path).await {
                Ok(pool) => break pool,
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    warn!(path = %path.display(), attempt, ?delay, error = %e, "retrying shard open");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(LatticeError::ShardUnavailable(format!(
                        "{}: {e}",
                        path.display()
                    )))
                }
            }
        };

        pools.insert(path.to_path_buf(), pool.clone());
        Ok(pool)
    }

    async fn open(&self, path: &Path) -> anyhow::Result<SqlitePool> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options)
            .await?;
        Ok(pool)
    }

    /// Drop the pool for a tombstoned shard.
    pub async fn evict(&self, path: &Path) {
        if let Some(pool) = self.pools.write().await.remove(path) {
            pool.close().await;
        }
    }

    pub async fn open_count(&self) -> usize {
        self.pools.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkout_creates_and_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(2);
        let path = tmp.path().join("s1/shard.db");

        let a = pool.checkout(&path).await.unwrap();
        let b = pool.checkout(&path).await.unwrap();
        // Same underlying pool: a write through one is visible to the other.
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&a)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (x) VALUES (1)")
            .execute(&b)
            .await
            .unwrap();
        let n: i64 = sqlx::query_scalar("SELECT count(*) FROM t")
            .fetch_one(&a)
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(pool.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_evict_closes() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new(2);
        let path = tmp.path().join("s1/shard.db");
        pool.checkout(&path).await.unwrap();
        pool.evict(&path).await;
        assert_eq!(pool.open_count().await, 0);
    }
}
