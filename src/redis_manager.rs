//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Job queue operations (BLPOP)
//! - Reply delivery (RPUSH + EXPIRE on the job's result key)
//!
//! Blocking pops and reply pushes use separate connections so a waiting BLPOP never
//! delays a reply.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::jobs::JobReply;

/// Replies live this long if nobody picks them up
const RESULT_EXPIRY_SECS: i64 = 300;

/// BLPOP wait before the loop gets a chance to observe shutdown
const POP_TIMEOUT_SECS: f64 = 5.0;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Owns the queue connection
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
    queue: String,
}

impl RedisManager {
    /// Connect to Redis and listen on `queue`
    pub async fn connect(redis_url: &str, queue: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            conn,
            queue: queue.into(),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Separate connection for replies, cheap to clone into job tasks
    pub async fn reply_sink(&self) -> Result<ReplySink> {
        let conn = get_connection_with_retry(&self.client).await?;
        Ok(ReplySink {
            client: self.client.clone(),
            conn,
        })
    }

    /// Wait for the next raw job payload.
    ///
    /// Returns `None` when the pop timed out with an empty queue. Reconnects on
    /// connection failure.
    pub async fn pop_job(&mut self) -> Result<Option<String>> {
        let result: Option<(String, String)> =
            match self.conn.blpop(&self.queue, POP_TIMEOUT_SECS).await {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                    self.conn = get_connection_with_retry(&self.client).await?;
                    return Ok(None);
                }
            };

        Ok(result.map(|(_, payload)| payload))
    }
}

/// Pushes job replies to their result keys
#[derive(Clone)]
pub struct ReplySink {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl ReplySink {
    /// RPUSH the reply so the caller's BLPOP can pick it up
    pub async fn push(&mut self, key: &str, reply: &JobReply) -> Result<()> {
        let json = serde_json::to_string(reply)?;

        if let Err(e) = self.conn.rpush::<_, _, ()>(key, &json).await {
            warn!("Failed to push reply to {}: {}. Reconnecting...", key, e);
            self.conn = get_connection_with_retry(&self.client).await?;
            self.conn
                .rpush::<_, _, ()>(key, &json)
                .await
                .with_context(|| format!("Failed to push reply to {}", key))?;
        }

        // Set expiry so the key does not linger if the caller went away
        if let Err(e) = self.conn.expire::<_, ()>(key, RESULT_EXPIRY_SECS).await {
            warn!("Failed to set expiry on {}: {}", key, e);
        }

        Ok(())
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
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
