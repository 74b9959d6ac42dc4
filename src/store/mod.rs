//! Per-shard embedded storage.
//!
//! Each shard is an independent SQLite file at
//! `{storage_path}/{shard_id}/shard.db` with three tables: `documents`,
//! `chunks`, and `vec_chunks` (embedding BLOBs). The [`ConnectionPool`]
//! hands out one `SqlitePool` per shard path with retrying checkout, the
//! [`ShardStore`] wraps a shard's schema and transactional writes, and the
//! [`BloomFilterManager`] keeps a per-shard bloom over document ids for
//! O(1) negative lookups.

pub mod bloom;
pub mod pool;
pub mod shard;

pub use bloom::BloomFilterManager;
pub use pool::ConnectionPool;
pub use shard::{ShardStore, ShardWriter};
