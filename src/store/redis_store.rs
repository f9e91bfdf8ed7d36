//! Redis-backed store shared by every worker process
//!
//! The counter uses Lua scripts so check-and-increment and clamped
//! decrement are single atomic operations. Stats live in one hash per user,
//! updated with an atomic pipeline.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use super::{stats_key, CounterStore, StatsStore};
use crate::core::UserStats;

const ACQUIRE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return -1
end
current = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return current
"#;

const RELEASE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
    redis.call('SET', KEYS[1], 0, 'EX', ARGV[1])
    return 0
end
current = redis.call('DECR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[1])
return current
"#;

const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Redis store; cheap to clone, reconnects automatically
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    acquire: Script,
    release: Script,
}

impl RedisStore {
    /// Connect to Redis, retrying until the server is reachable
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> ConnectionManager {
    loop {
        match ConnectionManager::new(client.clone()).await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in {} seconds...",
                    e,
                    CONNECT_RETRY_DELAY.as_secs()
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to read counter {}", key))?;
        Ok(value.unwrap_or(0))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let (value,): (u64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to increment counter {}", key))?;
        Ok(value)
    }

    async fn increment_below(
        &self,
        key: &str,
        ceiling: u64,
        ttl: Duration,
    ) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .acquire
            .key(key)
            .arg(ceiling)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to acquire slot on {}", key))?;
        Ok(u64::try_from(value).ok())
    }

    async fn decrement(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = self
            .release
            .key(key)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Failed to decrement counter {}", key))?;
        Ok(value)
    }
}

#[async_trait]
impl StatsStore for RedisStore {
    async fn record(
        &self,
        user_id: &str,
        elapsed: Duration,
        success: bool,
        ttl: Duration,
    ) -> Result<()> {
        let key = stats_key(user_id);
        let outcome_field = if success {
            "successful_jobs"
        } else {
            "failed_jobs"
        };

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("HINCRBY")
            .arg(&key)
            .arg("total_jobs")
            .arg(1)
            .ignore()
            .cmd("HINCRBY")
            .arg(&key)
            .arg(outcome_field)
            .arg(1)
            .ignore()
            .cmd("HINCRBYFLOAT")
            .arg(&key)
            .arg("total_time")
            .arg(elapsed.as_secs_f64())
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to record stats for {}", user_id))?;
        Ok(())
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<UserStats>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(stats_key(user_id))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Failed to read stats for {}", user_id))?;

        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_stats(&fields)))
    }
}

fn parse_stats(fields: &HashMap<String, String>) -> UserStats {
    let count = |name: &str| {
        fields
            .get(name)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };

    UserStats {
        total_jobs: count("total_jobs"),
        successful_jobs: count("successful_jobs"),
        failed_jobs: count("failed_jobs"),
        total_time: fields
            .get("total_time")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0),
    }
}
