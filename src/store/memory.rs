//! In-process store for tests and single-process deployments

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{stats_key, CounterStore, StatsStore};
use crate::core::UserStats;

#[derive(Debug)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
struct State {
    counters: HashMap<String, Entry<u64>>,
    stats: HashMap<String, Entry<UserStats>>,
}

impl State {
    fn counter(&self, key: &str) -> u64 {
        self.counters
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value)
            .unwrap_or(0)
    }

    fn set_counter(&mut self, key: &str, value: u64, ttl: Duration) -> u64 {
        self.counters
            .insert(key.to_string(), Entry::new(value, ttl));
        value
    }
}

/// Mutex-guarded in-memory store with TTL semantics
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<u64> {
        Ok(self.state.lock().await.counter(key))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut state = self.state.lock().await;
        let next = state.counter(key) + 1;
        Ok(state.set_counter(key, next, ttl))
    }

    async fn increment_below(
        &self,
        key: &str,
        ceiling: u64,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        let mut state = self.state.lock().await;
        let current = state.counter(key);
        if current >= ceiling {
            return Ok(None);
        }
        Ok(Some(state.set_counter(key, current + 1, ttl)))
    }

    async fn decrement(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut state = self.state.lock().await;
        let next = state.counter(key).saturating_sub(1);
        Ok(state.set_counter(key, next, ttl))
    }
}

#[async_trait]
impl StatsStore for MemoryStore {
    async fn record(
        &self,
        user_id: &str,
        elapsed: Duration,
        success: bool,
        ttl: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = stats_key(user_id);
        let mut stats = state
            .stats
            .remove(&key)
            .filter(|e| e.is_live())
            .map(|e| e.value)
            .unwrap_or_default();
        stats.record(elapsed, success);
        state.stats.insert(key, Entry::new(stats, ttl));
        Ok(())
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<UserStats>> {
        let state = self.state.lock().await;
        Ok(state
            .stats
            .get(&stats_key(user_id))
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }
}
