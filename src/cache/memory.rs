//! Bounded in-memory backend with LRU eviction and TTL expiry.

use super::{pattern, CacheAdapter, CacheEntry};
use crate::error::{Result, ThrottlerError};
use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub struct MemoryCache {
    state: Arc<Mutex<State>>,
    sweep_interval: Option<Duration>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    entries: LruCache<String, CacheEntry>,
    evictions: u64,
    expirations: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MemoryStats {
    pub entries: usize,
    pub capacity: usize,
    pub evictions: u64,
    pub expirations: u64,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(max_entries).ok_or_else(|| {
            ThrottlerError::Configuration("Cache max entries must be greater than 0".to_string())
        })?;

        Ok(Self {
            state: Arc::new(Mutex::new(State {
                entries: LruCache::new(capacity),
                evictions: 0,
                expirations: 0,
            })),
            sweep_interval: None,
            sweeper: Mutex::new(None),
        })
    }

    /// Sweep expired entries on this interval once connected.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| ThrottlerError::Internal("Failed to acquire cache lock".into()))
    }

    /// Remove every expired entry now. Returns the number removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut state = self.lock()?;
        Ok(purge(&mut state))
    }

    /// Entry metadata, without counting as an access.
    pub fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
        let state = self.lock()?;
        Ok(state.entries.peek(key).cloned())
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let state = self.lock()?;
        Ok(MemoryStats {
            entries: state.entries.len(),
            capacity: state.entries.cap().get(),
            evictions: state.evictions,
            expirations: state.expirations,
        })
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    fn start_sweeper(&self) -> Result<()> {
        let Some(interval) = self.sweep_interval else {
            return Ok(());
        };

        let mut guard = self
            .sweeper
            .lock()
            .map_err(|_| ThrottlerError::Internal("Failed to acquire sweeper lock".into()))?;
        if guard.is_some() {
            return Ok(());
        }

        // Weak so the task never keeps the cache alive.
        let state = Arc::downgrade(&self.state);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                let removed = match state.lock() {
                    Ok(mut state) => purge(&mut state),
                    Err(_) => break,
                };
                if removed > 0 {
                    debug!(removed = removed, "Swept expired cache entries");
                }
            }
        });

        debug!(interval = ?interval, "Started cache sweeper");
        *guard = Some(handle);
        Ok(())
    }

    pub fn stop_sweeper(&self) {
        if let Ok(mut guard) = self.sweeper.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
                debug!("Stopped cache sweeper");
            }
        }
    }
}

fn purge(state: &mut State) -> usize {
    let now = Instant::now();
    let expired: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, entry)| entry.is_expired_at(now))
        .map(|(key, _)| key.clone())
        .collect();

    for key in &expired {
        state.entries.pop(key);
    }
    state.expirations += expired.len() as u64;
    expired.len()
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn connect(&self) -> Result<()> {
        self.start_sweeper()
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut state = self.lock()?;
        let now = Instant::now();

        match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch();
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => {}
            None => return Ok(None),
        }

        state.entries.pop(key);
        state.expirations += 1;
        trace!(key = %key, "Expired cache entry dropped on read");
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<bool> {
        let mut state = self.lock()?;
        let entry = CacheEntry::new(key, value, ttl);

        if let Some((evicted, _)) = state.entries.push(key.to_string(), entry) {
            if evicted != key {
                state.evictions += 1;
                debug!(evicted = %evicted, "Evicted least recently used cache entry");
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<usize> {
        let mut state = self.lock()?;

        if !pattern::is_pattern(key) {
            return Ok(state.entries.pop(key).map_or(0, |_| 1));
        }

        let re = pattern::compile(key)?;
        let matching: Vec<String> = state
            .entries
            .iter()
            .filter(|(k, _)| re.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();

        for k in &matching {
            state.entries.pop(k);
        }
        Ok(matching.len())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let expired = match state.entries.peek(key) {
            Some(entry) => entry.is_expired(),
            None => return Ok(false),
        };

        if expired {
            state.entries.pop(key);
            state.expirations += 1;
        }
        Ok(!expired)
    }

    async fn clear(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let removed = state.entries.len();
        state.entries.clear();
        Ok(removed)
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let state = self.lock()?;
        let re = pattern.map(pattern::compile).transpose()?;
        let now = Instant::now();

        Ok(state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .filter(|(k, _)| re.as_ref().map_or(true, |re| re.is_match(k)))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_sweeper();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
