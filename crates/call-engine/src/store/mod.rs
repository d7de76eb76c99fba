//! The durable shared store boundary.
//!
//! Everything the control plane persists goes through [`SharedStore`]: plain
//! keys with TTLs, hashes, sets, sorted sets, a set-if-absent-with-TTL
//! primitive for distributed locks, check-and-delete for releasing them, an
//! atomic batch for multi-key mutations that must never be observed
//! half-applied, and a pub/sub channel for light-weight invalidation notices.
//!
//! [`RedisStore`] is the production implementation; [`MemoryStore`] backs
//! tests and degraded local development.

pub mod keys;
pub mod lock;
pub mod memory;
pub mod redis;

pub use lock::DistributedLock;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Shared store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (timeouts, disconnects)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation
    #[error("store protocol error: {0}")]
    Protocol(String),

    /// Document (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
    Set { key: String, value: String },
    SetEx { key: String, value: String, ttl_secs: u64 },
    Del { key: String },
    Expire { key: String, ttl_secs: u64 },
    HSet { key: String, field: String, value: String },
    HSetAll { key: String, fields: Vec<(String, String)> },
    HIncrBy { key: String, field: String, delta: i64 },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
}

/// Key/value document storage with TTL, hash/set/sorted-set operations, a
/// set-if-absent-with-TTL primitive and pub/sub.
///
/// All operations are safe under concurrent invocation from multiple workers
/// and multiple processes; [`apply_batch`](SharedStore::apply_batch) is the
/// only way to mutate several keys atomically.
#[async_trait]
pub trait SharedStore: Send + Sync {
    // ----- plain keys -----
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;
    async fn del(&self, key: &str) -> StoreResult<bool>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<bool>;
    /// Remaining TTL in seconds; `None` when the key has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<i64>>;

    /// `SET key value NX EX ttl` — returns true when the key was absent and
    /// is now set. The distributed-lock acquisition primitive.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<bool>;

    /// Delete the key only if it currently holds `value`. The lock-release
    /// primitive: a holder whose TTL expired cannot delete a later holder's
    /// lock.
    async fn del_if_value(&self, key: &str, value: &str) -> StoreResult<bool>;

    // ----- hashes -----
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    async fn hset_all(&self, key: &str, fields: Vec<(String, String)>) -> StoreResult<()>;
    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    // ----- sets -----
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    // ----- sorted sets -----
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn zcard(&self, key: &str) -> StoreResult<u64>;
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<String>>;
    /// All members with their scores, ascending.
    async fn zrange_with_scores(&self, key: &str) -> StoreResult<Vec<(String, f64)>>;

    // ----- batches -----
    /// Apply every operation atomically: other clients observe all of them
    /// or none of them.
    async fn apply_batch(&self, ops: Vec<StoreOp>) -> StoreResult<()>;

    // ----- pub/sub -----
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;
    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::UnboundedReceiver<String>>;
}
