//! Redis integration for the Conveyor service
//!
//! Redis is the wake-up channel between producers and workers and the
//! shared fixed-window rate limiter. The service degrades gracefully
//! when Redis is unavailable: workers fall back to polling and rate
//! limits are enforced locally.

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RedisSettings;

/// Redis connection wrapper
#[derive(Clone)]
pub struct RedisCache {
    client: Client,
    connection: Arc<tokio::sync::RwLock<Option<MultiplexedConnection>>>,
}

impl RedisCache {
    /// Connect to Redis with the given settings
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        // The URL may carry credentials, log the host only
        info!(host = %settings.host, "Connecting to Redis");

        let url = settings.connection_url();
        let client = Client::open(url.as_str()).context("Failed to create Redis client")?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to connect to Redis")?;

        // Test connection
        let mut conn = connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Failed to ping Redis")?;

        info!("Redis connection established");

        Ok(Self {
            client,
            connection: Arc::new(tokio::sync::RwLock::new(Some(connection))),
        })
    }

    /// Get a connection, reconnecting if necessary
    pub async fn get_connection(&self) -> Result<MultiplexedConnection> {
        {
            let guard = self.connection.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }

        // Reconnect with timeout
        let mut guard = self.connection.write().await;
        if guard.is_none() {
            info!("Reconnecting to Redis");
            let conn_future = self.client.get_multiplexed_async_connection();
            let conn = tokio::time::timeout(std::time::Duration::from_secs(10), conn_future)
                .await
                .context("Redis connection timeout")?
                .context("Failed to reconnect to Redis")?;
            *guard = Some(conn);
        }

        Ok(guard.as_ref().unwrap().clone())
    }

    /// Publish a message to a channel
    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.publish(channel, message).await?;
        debug!(channel = %channel, "Published message");
        Ok(())
    }

    /// Subscribe to a channel (returns a PubSub handle)
    pub async fn subscribe(&self, channel: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("Failed to create pubsub connection")?;

        pubsub.subscribe(channel).await?;
        info!(channel = %channel, "Subscribed to channel");

        Ok(pubsub)
    }

    /// Health check
    pub async fn health_check(&self) -> Result<bool> {
        match self.get_connection().await {
            Ok(mut conn) => match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => Ok(true),
                Err(e) => {
                    warn!(error = %e, "Redis health check failed");
                    Ok(false)
                }
            },
            Err(e) => {
                warn!(error = %e, "Redis connection failed");
                Ok(false)
            }
        }
    }

    /// Fixed-window rate limiting: check if one more job start is allowed
    ///
    /// Uses atomic INCR + EXPIRE in a Lua script to prevent the race
    /// where the key could expire between INCR and EXPIRE.
    pub async fn check_rate_limit(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
    ) -> Result<RateLimitResult> {
        let mut conn = self.get_connection().await?;

        let script = redis::Script::new(
            r#"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
                redis.call('EXPIRE', KEYS[1], ARGV[1])
            end
            local ttl = redis.call('TTL', KEYS[1])
            if ttl < 0 then
                ttl = tonumber(ARGV[1])
            end
            return {count, ttl}
            "#,
        );

        let (count, ttl): (i64, i64) = script
            .key(key)
            .arg(window_secs as i64)
            .invoke_async(&mut conn)
            .await?;

        Ok(RateLimitResult {
            allowed: count <= limit as i64,
            remaining: (limit as i64 - count).max(0) as u32,
            reset_at: chrono::Utc::now() + chrono::Duration::seconds(ttl),
        })
    }

    /// Return an unused rate-limit token to the current window
    ///
    /// Called when a token was taken but no job start happened (the
    /// claim came back empty). DECR runs only while the key exists;
    /// an already-expired window is left untouched.
    pub async fn refund_rate_limit(&self, key: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;

        let script = redis::Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return redis.call('DECR', KEYS[1])
            end
            return 0
            "#,
        );

        let _: i64 = script.key(key).invoke_async(&mut conn).await?;
        Ok(())
    }
}

/// Rate limit check result
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Remaining requests in window
    pub remaining: u32,
    /// When the rate limit resets
    pub reset_at: chrono::DateTime<chrono::Utc>,
}
