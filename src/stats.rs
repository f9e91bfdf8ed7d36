//! Per-user execution statistics

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::UserStats;
use crate::store::{StatsStore, STATS_TTL};

#[derive(Clone)]
pub struct StatsTracker {
    store: Arc<dyn StatsStore>,
}

impl StatsTracker {
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self { store }
    }

    /// Record one finished job and refresh the retention window
    pub async fn update(&self, user_id: &str, elapsed: Duration, success: bool) -> Result<()> {
        debug!(
            "Recording job for {}: success={} elapsed={:.3}s",
            user_id,
            success,
            elapsed.as_secs_f64()
        );
        self.store.record(user_id, elapsed, success, STATS_TTL).await
    }

    /// Stats for a user; unknown users get zeroed stats
    pub async fn get(&self, user_id: &str) -> Result<UserStats> {
        Ok(self.store.fetch(user_id).await?.unwrap_or_default())
    }
}
