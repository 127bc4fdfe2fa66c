use crate::cache::Cache;
use crate::classifier::{SignatureClassifier, UaClassification, UaClassifier};
use crate::clock::{Clock, SystemClock};
use crate::context::RequestContext;
use crate::error::{Result, ThrottlerError};
use crate::identity::{KeySpace, ThrottleIdentity};
use crate::records::{BanRecord, IpRecord, ThrottleRecord};
use crate::throttle_config::{merge, Consistency, EffectiveConfig, Policy, ThrottleConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

/// Idle per-IP locks are dropped once the table grows past this size.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    Ok,
    InvalidIdentity,
    AutoBan,
    UaRotation,
    BurstLimit,
    SlidingWindow,
}

impl ThrottleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleReason::Ok => "ok",
            ThrottleReason::InvalidIdentity => "invalid_identity",
            ThrottleReason::AutoBan => "auto_ban",
            ThrottleReason::UaRotation => "ua_rotation",
            ThrottleReason::BurstLimit => "burst_limit",
            ThrottleReason::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of a single `check()`. `reason` is `None` only for bypassed requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleResult {
    pub restricted: bool,
    pub reason: Option<ThrottleReason>,
    pub ua_classification: Option<UaClassification>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub bypassed: bool,
}

impl ThrottleResult {
    pub fn allowed(classification: UaClassification) -> Self {
        Self {
            restricted: false,
            reason: Some(ThrottleReason::Ok),
            ua_classification: Some(classification),
            bypassed: false,
        }
    }

    pub fn denied(reason: ThrottleReason, classification: UaClassification) -> Self {
        Self {
            restricted: true,
            reason: Some(reason),
            ua_classification: Some(classification),
            bypassed: false,
        }
    }

    pub fn invalid_identity() -> Self {
        Self {
            restricted: true,
            reason: Some(ThrottleReason::InvalidIdentity),
            ua_classification: None,
            bypassed: false,
        }
    }

    pub fn bypassed() -> Self {
        Self {
            restricted: false,
            reason: None,
            ua_classification: None,
            bypassed: true,
        }
    }
}

/// Read-only view of a client's throttle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleStatus {
    pub ip: String,
    pub banned: bool,
    pub banned_until: Option<u64>,
    pub tracked_user_agents: usize,
    pub window_usage: u64,
    pub burst_usage: u64,
    pub violations: u32,
    pub limit: u64,
    pub burst_limit: u64,
}

/// Adaptive throttle: sliding window, burst window, weighted cost, UA-rotation
/// detection and automatic bans, with all state kept in the injected [`Cache`].
pub struct ThrottleEngine {
    config: ThrottleConfig,
    cache: Cache,
    keys: KeySpace,
    classifier: Arc<dyn UaClassifier>,
    clock: Arc<dyn Clock>,
    policy: Option<Policy>,
    ip_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ThrottleEngine {
    /// Fails with `Configuration` if the settings are unusable.
    pub fn new(config: ThrottleConfig, cache: Cache) -> Result<Self> {
        let config = config.validated()?;
        let keys = KeySpace::new(&config.namespace);

        Ok(Self {
            config,
            cache,
            keys,
            classifier: Arc::new(SignatureClassifier::new()),
            clock: Arc::new(SystemClock),
            policy: None,
            ip_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn UaClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Base config with the policy's override, if any, laid on top.
    pub fn resolve_config(
        &self,
        ip: &str,
        user_agent: &str,
        context: &RequestContext,
    ) -> EffectiveConfig {
        let over = self
            .policy
            .as_ref()
            .and_then(|policy| policy(ip, user_agent, context));
        merge(&self.config, over.as_ref())
    }

    /// Decide whether a request from `(ip, user_agent)` may proceed.
    ///
    /// Denials are returned as results; `Err` means the state store failed.
    pub async fn check(
        &self,
        ip: &str,
        user_agent: &str,
        context: &RequestContext,
    ) -> Result<ThrottleResult> {
        let ip = ip.trim();
        let user_agent = user_agent.trim();

        if ip.is_empty() || user_agent.is_empty() {
            debug!("Rejecting request with incomplete identity");
            return Ok(ThrottleResult::invalid_identity());
        }

        if context.bypass {
            trace!(ip = %ip, "Throttle bypassed by upstream");
            return Ok(ThrottleResult::bypassed());
        }

        let _guard = match self.config.consistency {
            Consistency::Strict => Some(self.lock_ip(ip).await?),
            Consistency::BestEffort => None,
        };

        let effective = self.resolve_config(ip, user_agent, context);
        let classification = self.classifier.classify(user_agent);
        let identity = ThrottleIdentity::new(ip, user_agent);
        let now = self.clock.now_ms();

        let ban_key = self.keys.ban_key(&identity.ip);
        let ban: Option<BanRecord> = self.store(self.cache.get_json(&ban_key)).await?;
        if let Some(ban) = ban.filter(|ban| ban.is_active(now)) {
            debug!(ip = %identity.ip, banned_until = ban.banned_until, "Request from banned IP");
            return Ok(ThrottleResult::denied(ThrottleReason::AutoBan, classification));
        }

        let ip_key = self.keys.ip_key(&identity.ip);
        let mut ip_record: IpRecord = self
            .store(self.cache.get_json(&ip_key))
            .await?
            .unwrap_or_default();
        ip_record.prune(now, effective.ua_retention_ms);

        if !ip_record.contains(&identity.ua_hash)
            && ip_record.len() >= effective.ua_rotation_threshold
        {
            warn!(
                ip = %identity.ip,
                tracked = ip_record.len(),
                threshold = effective.ua_rotation_threshold,
                "User-agent rotation detected"
            );
            return Ok(ThrottleResult::denied(ThrottleReason::UaRotation, classification));
        }

        ip_record.observe(&identity.ua_hash, now);
        self.store(self.cache.set_json(
            &ip_key,
            &ip_record,
            Some(Duration::from_millis(effective.ua_retention_ms)),
        ))
        .await?;

        let record_key = self.keys.record_key(&identity);
        let mut record: ThrottleRecord = self
            .store(self.cache.get_json(&record_key))
            .await?
            .unwrap_or_default();

        if record.decay(now, effective.violation_decay_ms) {
            trace!(key = %record_key, violations = record.violations, "Violation decayed");
        }

        let weight = effective.weight_for(&classification);
        record.prune(now, effective.window_ms, effective.burst_window_ms);

        let verdict = if record.burst_usage().saturating_add(weight) > effective.burst_limit {
            Some(ThrottleReason::BurstLimit)
        } else if record.window_usage().saturating_add(weight) > effective.limit {
            Some(ThrottleReason::SlidingWindow)
        } else {
            None
        };

        let result = match verdict {
            Some(reason) => {
                let violations = record.register_violation(now);
                if violations >= effective.ban_threshold {
                    let ban = BanRecord::until(now.saturating_add(effective.ban_ms));
                    self.store(self.cache.set_json(
                        &ban_key,
                        &ban,
                        Some(Duration::from_millis(effective.ban_ms)),
                    ))
                    .await?;
                    warn!(
                        ip = %identity.ip,
                        violations = violations,
                        banned_until = ban.banned_until,
                        "IP banned after repeated violations"
                    );
                }
                debug!(
                    key = %record_key,
                    reason = %reason,
                    weight = weight,
                    violations = violations,
                    "Request throttled"
                );
                ThrottleResult::denied(reason, classification)
            }
            None => {
                record.record_hits(now, weight);
                trace!(
                    key = %record_key,
                    weight = weight,
                    window_usage = record.window_usage(),
                    "Request allowed"
                );
                ThrottleResult::allowed(classification)
            }
        };

        self.store(self.cache.set_json(&record_key, &record, None))
            .await?;

        Ok(result)
    }

    /// Snapshot of the stored state for `(ip, user_agent)`, measured against the
    /// settings the policy would apply to a plain request. Writes nothing.
    pub async fn status(&self, ip: &str, user_agent: &str) -> Result<ThrottleStatus> {
        let effective =
            self.resolve_config(ip.trim(), user_agent.trim(), &RequestContext::default());
        let identity = ThrottleIdentity::new(ip, user_agent);
        let now = self.clock.now_ms();

        let ban: Option<BanRecord> = self
            .store(self.cache.get_json(&self.keys.ban_key(&identity.ip)))
            .await?;
        let active_ban = ban.filter(|ban| ban.is_active(now));

        let mut ip_record: IpRecord = self
            .store(self.cache.get_json(&self.keys.ip_key(&identity.ip)))
            .await?
            .unwrap_or_default();
        ip_record.prune(now, effective.ua_retention_ms);

        let mut record: ThrottleRecord = self
            .store(self.cache.get_json(&self.keys.record_key(&identity)))
            .await?
            .unwrap_or_default();
        record.prune(now, effective.window_ms, effective.burst_window_ms);

        Ok(ThrottleStatus {
            ip: identity.ip,
            banned: active_ban.is_some(),
            banned_until: active_ban.map(|ban| ban.banned_until),
            tracked_user_agents: ip_record.len(),
            window_usage: record.window_usage(),
            burst_usage: record.burst_usage(),
            violations: record.violations,
            limit: effective.limit,
            burst_limit: effective.burst_limit,
        })
    }

    /// Forget everything stored about `ip`, ban included. Returns the number of keys removed.
    ///
    /// Record keys are listed and matched exactly, so neighbouring IPv6 addresses
    /// and the other key families survive.
    pub async fn reset(&self, ip: &str) -> Result<usize> {
        let candidates = self
            .store(self.cache.keys(Some(&self.keys.records_pattern(ip))))
            .await?;

        let mut removed = 0;
        for key in candidates
            .iter()
            .filter(|key| self.keys.is_record_key_for(key, ip))
        {
            removed += self.store(self.cache.delete(key)).await?;
        }
        removed += self.store(self.cache.delete(&self.keys.ip_key(ip))).await?;
        removed += self.store(self.cache.delete(&self.keys.ban_key(ip))).await?;

        debug!(ip = %ip, removed = removed, "Throttle state reset");
        Ok(removed)
    }

    async fn store<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.config.store_timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| ThrottlerError::StoreTimeout(limit))?,
            None => op.await,
        }
    }

    async fn lock_ip(&self, ip: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .ip_locks
                .lock()
                .map_err(|_| ThrottlerError::Internal("Failed to acquire lock table".into()))?;
            if locks.len() >= LOCK_TABLE_PRUNE_AT {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(ip.to_string()).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }
}

impl fmt::Debug for ThrottleEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleEngine")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("policy", &self.policy.is_some())
            .finish()
    }
}
