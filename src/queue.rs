//! Redis job queue for the worker binary
//!
//! Jobs arrive on a list (BLPOP); replies are stored under a per-request key
//! for polling and published on a channel for subscribers.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::jobs::{JobReply, WorkerJob};

/// Redis key constants
pub mod keys {
    /// Job queue key
    pub const EXEC_QUEUE: &str = "exec:queue";

    /// Reply key prefix (for polling)
    pub const EXEC_RESULT_PREFIX: &str = "exec:result:";

    /// Reply channel (for pub/sub)
    pub const EXEC_RESULT_CHANNEL: &str = "exec:results";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub fn reply_key(request_id: &str) -> String {
    format!("{}{}", keys::EXEC_RESULT_PREFIX, request_id)
}

/// Job queue connection.
///
/// Blocking pops get their own connection so a waiting BLPOP never delays
/// reply writes. Clones share the reply connection.
#[derive(Clone)]
pub struct JobQueue {
    client: redis::Client,
    pop_conn: MultiplexedConnection,
    reply_conn: MultiplexedConnection,
}

impl JobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let pop_conn = get_connection_with_retry(&client).await;
        let reply_conn = get_connection_with_retry(&client).await;
        info!("Job queue connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            pop_conn,
            reply_conn,
        })
    }

    /// Block until the next parseable job arrives.
    ///
    /// Reconnects on connection failure; malformed payloads are logged and
    /// skipped.
    pub async fn pop_job(&mut self) -> WorkerJob {
        loop {
            let result: Option<(String, String)> =
                match self.pop_conn.blpop(keys::EXEC_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.pop_conn = get_connection_with_retry(&self.client).await;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<WorkerJob>(&job_data) {
                    Ok(job) => return job,
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    /// Store a reply with a 1-hour expiry and publish it
    pub async fn store_reply(&mut self, reply: &JobReply) -> Result<()> {
        let json = serde_json::to_string(reply)?;
        let key = reply_key(&reply.request_id);

        if let Err(e) = self
            .reply_conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store reply: {}. Reconnecting...", e);
            self.reply_conn = get_connection_with_retry(&self.client).await;
            self.reply_conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await
                .with_context(|| format!("Failed to store reply {}", key))?;
        }

        // No subscribers is not an error
        if let Err(e) = self
            .reply_conn
            .publish::<_, _, ()>(keys::EXEC_RESULT_CHANNEL, &json)
            .await
        {
            warn!("Failed to publish reply {}: {}", reply.request_id, e);
        }

        Ok(())
    }
}

async fn get_connection_with_retry(client: &redis::Client) -> MultiplexedConnection {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in {} seconds...",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
