use super::{pattern, CacheAdapter};
use crate::error::{Result, ThrottlerError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Redis-backed adapter. Values are stored as JSON strings; TTLs map to `PX`.
pub struct RedisCache {
    client: Client,
    key_prefix: String,
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl RedisCache {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            ThrottlerError::AdapterConnection(format!("Failed to create Redis client: {}", e))
        })?;

        Ok(Self {
            client,
            key_prefix: String::new(),
            connection: RwLock::new(None),
        })
    }

    /// Namespace every key this adapter touches.
    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefix = prefix.to_string();
        self
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn full_glob(&self, pattern: &str) -> String {
        pattern::to_redis_glob(&format!("{}{}", self.key_prefix, pattern))
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| ThrottlerError::AdapterOperation("Redis cache is not connected".into()))
    }

    async fn matching_keys(&self, glob: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = redis::cmd("KEYS").arg(glob).query_async(&mut conn).await?;
        Ok(keys)
    }

    async fn delete_all(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let removed: usize = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }
}

#[async_trait]
impl CacheAdapter for RedisCache {
    async fn connect(&self) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                ThrottlerError::AdapterConnection(format!("Failed to connect to Redis: {}", e))
            })?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ThrottlerError::AdapterConnection(format!("Ping failed: {}", e)))?;

        *self.connection.write().await = Some(conn);
        info!("Connected to Redis");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&value)?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(payload);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }

        let _: String = cmd.query_async(&mut conn).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<usize> {
        if !pattern::is_pattern(key) {
            let mut conn = self.conn().await?;
            let removed: usize = redis::cmd("DEL")
                .arg(self.full_key(key))
                .query_async(&mut conn)
                .await?;
            return Ok(removed);
        }

        let keys = self.matching_keys(&self.full_glob(key)).await?;
        let removed = self.delete_all(&keys).await?;
        debug!(pattern = %key, removed = removed, "Deleted Redis keys by pattern");
        Ok(removed)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(exists > 0)
    }

    async fn clear(&self) -> Result<usize> {
        let keys = self.matching_keys(&self.full_glob("*")).await?;
        self.delete_all(&keys).await
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let keys = self
            .matching_keys(&self.full_glob(pattern.unwrap_or("*")))
            .await?;

        Ok(keys
            .into_iter()
            .map(|k| {
                k.strip_prefix(self.key_prefix.as_str())
                    .map(str::to_string)
                    .unwrap_or(k)
            })
            .collect())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connection.write().await.take().is_some() {
            info!("Disconnected from Redis");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
