//! Shared state stores
//!
//! The concurrency counter and per-user stats are the only process-wide
//! mutable state. They live behind these traits so production can use Redis
//! (shared across worker processes) and tests can use in-memory fakes. Every
//! mutation is a single atomic operation on the store side.

pub mod memory;
pub mod redis_store;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::core::UserStats;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Store key constants
pub mod keys {
    /// Number of sandboxed jobs currently running
    pub const ACTIVE_JOBS: &str = "active_jobs";

    /// Per-user stats key prefix (`stats:<user_id>`)
    pub const STATS_PREFIX: &str = "stats:";
}

/// Soft TTL of the concurrency counter, refreshed on every write
pub const ACTIVE_JOBS_TTL: Duration = Duration::from_secs(5 * 60);

/// Retention of per-user stats, refreshed on every update
pub const STATS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Integer counter with TTL
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current value, 0 when absent or expired
    async fn get(&self, key: &str) -> Result<u64>;

    /// Increment unconditionally and refresh the TTL
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Increment only if the current value is below `ceiling`.
    /// Returns the new value, or `None` when the ceiling was reached.
    async fn increment_below(&self, key: &str, ceiling: u64, ttl: Duration)
        -> Result<Option<u64>>;

    /// Decrement, clamping at zero, and refresh the TTL
    async fn decrement(&self, key: &str, ttl: Duration) -> Result<u64>;
}

/// Per-user execution counters with TTL
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Record one finished job for `user_id`
    async fn record(
        &self,
        user_id: &str,
        elapsed: Duration,
        success: bool,
        ttl: Duration,
    ) -> Result<()>;

    /// Stats for `user_id`, `None` when never recorded or expired
    async fn fetch(&self, user_id: &str) -> Result<Option<UserStats>>;
}

/// Stats key for a user
pub fn stats_key(user_id: &str) -> String {
    format!("{}{}", keys::STATS_PREFIX, user_id)
}
