//! Key/value state store with TTL and wildcard deletion.
//!
//! Every backend implements [`CacheAdapter`]; callers hold a [`Cache`], which
//! adds typed JSON helpers on top of whichever adapter was configured.

pub mod memory;
pub mod pattern;
pub mod redis;

pub use memory::{MemoryCache, MemoryStats};
pub use self::redis::RedisCache;

use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Contract shared by every storage backend.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Establish backend connectivity. Called once at configuration time.
    async fn connect(&self) -> Result<()>;

    /// `None` on a miss or on an entry found to be expired.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Upsert. A `ttl` of `None` means the entry never expires.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool>;

    /// Remove a key, or every key matching a `*` pattern. Returns the count removed.
    async fn delete(&self, key: &str) -> Result<usize>;

    async fn has(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<usize>;

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>>;

    async fn disconnect(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// A stored value plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: Instant,
    pub ttl: Option<Duration>,
    pub last_accessed: Instant,
    pub hit_count: u64,
}

impl CacheEntry {
    pub fn new(key: &str, value: Value, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            key: key.to_string(),
            value,
            created_at: now,
            ttl,
            last_accessed: now,
            hit_count: 0,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.created_at) > ttl,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub(crate) fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.hit_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub redis_url: String,
    pub max_entries: usize,
    pub sweep_interval: Option<Duration>,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_entries: 10_000,
            sweep_interval: Some(Duration::from_secs(60)),
            key_prefix: String::new(),
        }
    }
}

/// Shared handle to the configured backend.
#[derive(Clone)]
pub struct Cache {
    adapter: Arc<dyn CacheAdapter>,
}

impl Cache {
    pub fn new(adapter: Arc<dyn CacheAdapter>) -> Self {
        Self { adapter }
    }

    /// Build the configured backend and connect it.
    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        let adapter: Arc<dyn CacheAdapter> = match config.backend {
            CacheBackend::Memory => {
                let mut cache = MemoryCache::new(config.max_entries)?;
                if let Some(interval) = config.sweep_interval {
                    cache = cache.with_sweep_interval(interval);
                }
                Arc::new(cache)
            }
            CacheBackend::Redis => Arc::new(
                RedisCache::new(&config.redis_url)?.with_key_prefix(&config.key_prefix),
            ),
        };

        adapter.connect().await?;
        info!(backend = adapter.backend_name(), "Cache connected");

        Ok(Self::new(adapter))
    }

    pub fn adapter(&self) -> &Arc<dyn CacheAdapter> {
        &self.adapter
    }

    pub fn backend(&self) -> &'static str {
        self.adapter.backend_name()
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.adapter.get(key).await
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        self.adapter.set(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<usize> {
        self.adapter.delete(key).await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        self.adapter.has(key).await
    }

    pub async fn clear(&self) -> Result<usize> {
        self.adapter.clear().await
    }

    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        self.adapter.keys(pattern).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.adapter.disconnect().await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.adapter.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let value = serde_json::to_value(value)?;
        self.adapter.set(key, value, ttl).await
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("backend", &self.adapter.backend_name())
            .finish()
    }
}
