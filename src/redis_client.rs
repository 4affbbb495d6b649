use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};

use crate::ephemeral::{EphemeralStore, StoreError, WindowCount};

/// INCR and set the expiry only on the first hit of a window, in one round trip.
static INCR_WINDOW: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local count = redis.call('INCR', KEYS[1])
        if count == 1 then
            redis.call('EXPIRE', KEYS[1], ARGV[1])
        end
        return {count, redis.call('TTL', KEYS[1])}
        ",
    )
});

/// LPUSH, trim to the cap, refresh the TTL and read the list back.
static PUSH_RECENT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        redis.call('LPUSH', KEYS[1], ARGV[1])
        redis.call('LTRIM', KEYS[1], 0, tonumber(ARGV[2]) - 1)
        redis.call('EXPIRE', KEYS[1], ARGV[3])
        return redis.call('LRANGE', KEYS[1], 0, -1)
        ",
    )
});

/// Redis client wrapper for the shared ephemeral store.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    /// Connect through a `ConnectionManager`, which reconnects on its own
    /// after the server comes back.
    pub async fn new(redis_url: &str) -> Result<Self> {
        if !redis_url.contains("://") {
            return Err(anyhow::anyhow!(
                "Invalid Redis URL format. Expected: redis://:password@host:port or rediss://:password@host:port"
            ));
        }

        if !redis_url.contains('@') {
            tracing::warn!("REDIS_URL does not include a password; use redis://:password@host:port in production");
        }

        let client = Client::open(redis_url).context("Failed to create Redis client from URL")?;

        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager - check REDIS_URL and password")?;

        Ok(Self { manager })
    }
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl EphemeralStore for RedisClient {
    async fn incr_window(&self, key: &str, window_secs: u64) -> Result<WindowCount, StoreError> {
        let mut conn = self.manager.clone();
        let (count, ttl_secs): (i64, i64) = INCR_WINDOW
            .key(key)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(WindowCount { count, ttl_secs })
    }

    async fn push_recent(
        &self,
        key: &str,
        entry: &str,
        cap: usize,
        ttl_secs: u64,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        PUSH_RECENT
            .key(key)
            .arg(entry)
            .arg(cap.max(1))
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn mark(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        conn.set_ex(key, "1", ttl_secs).await.map_err(unavailable)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        conn.exists(key).await.map_err(unavailable)
    }

    async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|resp| resp == "PONG")
            .unwrap_or(false)
    }
}
