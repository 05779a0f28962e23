//! Shared, externally visible key-value store.
//!
//! Rate-limit counters and cache entries live here rather than in process
//! memory so that limits and invalidations hold across every server instance.
//! All counter mutations go through [`SharedStore::hit_window`], which checks
//! and increments in one indivisible step on the store side.
//!
//! - [`MemoryStore`]: single-process store for tests and development
//! - `RedisStore` (feature `redis`): Lua-scripted production store

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors talking to the shared store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

/// Outcome of one atomic check-and-increment against a window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Whether this hit was counted (the counter was below the limit).
    pub accepted: bool,
    /// Counter value after this call. Never exceeds the limit.
    pub count: u64,
    /// Time until the window key expires.
    pub ttl: Duration,
}

/// Shared store operations used by the rate limiter and cache manager.
///
/// Used as `Arc<dyn SharedStore>`.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Atomically: if the counter at `key` is below `limit`, increment it
    /// (creating it with `ttl` on first use) and accept; otherwise reject
    /// without incrementing. A rejected hit never mutates the counter.
    async fn hit_window(&self, key: &str, limit: u64, ttl: Duration)
        -> Result<WindowHit, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Deletes one key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Deletes every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Round-trips to the store. Used by readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;
}
