//! Throttle state as persisted in the cache.
//!
//! All timestamps are milliseconds since the Unix epoch.

use serde::{Deserialize, Serialize};

/// Per-identity sliding-window state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRecord {
    #[serde(default)]
    pub hits: Vec<u64>,
    #[serde(default)]
    pub burst: Vec<u64>,
    #[serde(default)]
    pub violations: u32,
    #[serde(default)]
    pub last_violation: u64,
}

impl ThrottleRecord {
    /// Forgive one violation once `decay_ms` has passed since the last one.
    /// Returns whether a violation was forgiven.
    pub fn decay(&mut self, now: u64, decay_ms: u64) -> bool {
        if self.violations > 0 && now.saturating_sub(self.last_violation) > decay_ms {
            self.violations -= 1;
            self.last_violation = now;
            true
        } else {
            false
        }
    }

    /// Drop hits older than `window_ms` and burst entries older than `burst_window_ms`.
    pub fn prune(&mut self, now: u64, window_ms: u64, burst_window_ms: u64) {
        let window_start = now.saturating_sub(window_ms);
        let burst_start = now.saturating_sub(burst_window_ms);
        self.hits.retain(|&t| t >= window_start && t <= now);
        self.burst.retain(|&t| t >= burst_start && t <= now);
    }

    /// Returns the violation count after registering this one.
    pub fn register_violation(&mut self, now: u64) -> u32 {
        self.violations = self.violations.saturating_add(1);
        self.last_violation = now;
        self.violations
    }

    pub fn record_hits(&mut self, now: u64, weight: u64) {
        let weight = weight as usize;
        self.hits.extend(std::iter::repeat(now).take(weight));
        self.burst.extend(std::iter::repeat(now).take(weight));
    }

    pub fn window_usage(&self) -> u64 {
        self.hits.len() as u64
    }

    pub fn burst_usage(&self) -> u64 {
        self.burst.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UaSighting {
    pub hash: String,
    pub last_seen: u64,
}

/// Distinct user agents recently seen from one IP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRecord {
    #[serde(default)]
    pub uas: Vec<UaSighting>,
}

impl IpRecord {
    /// Forget user agents not seen within `retention_ms`.
    pub fn prune(&mut self, now: u64, retention_ms: u64) {
        let cutoff = now.saturating_sub(retention_ms);
        self.uas.retain(|ua| ua.last_seen >= cutoff);
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.uas.iter().any(|ua| ua.hash == hash)
    }

    /// Mark `hash` as seen at `now`. Returns `true` if it was not tracked yet.
    pub fn observe(&mut self, hash: &str, now: u64) -> bool {
        match self.uas.iter_mut().find(|ua| ua.hash == hash) {
            Some(existing) => {
                existing.last_seen = now;
                false
            }
            None => {
                self.uas.push(UaSighting {
                    hash: hash.to_string(),
                    last_seen: now,
                });
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.uas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uas.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    pub banned_until: u64,
}

impl BanRecord {
    pub fn until(banned_until: u64) -> Self {
        Self { banned_until }
    }

    /// A stale record is equivalent to no ban at all.
    pub fn is_active(&self, now: u64) -> bool {
        self.banned_until > now
    }
}
