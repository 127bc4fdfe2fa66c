use crate::classifier::UaClassification;
use crate::context::RequestContext;
use crate::error::{Result, ThrottlerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

pub const DEFAULT_BURST_LIMIT: u64 = 20;
pub const DEFAULT_BURST_WINDOW_MS: u64 = 1_000;
pub const DEFAULT_BAN_THRESHOLD: u32 = 5;
pub const DEFAULT_BAN_MS: u64 = 24 * 60 * 60 * 1_000;
pub const DEFAULT_VIOLATION_DECAY_MS: u64 = 60 * 60 * 1_000;
pub const DEFAULT_UA_ROTATION_THRESHOLD: usize = 5;
pub const DEFAULT_UA_RETENTION_MS: u64 = 24 * 60 * 60 * 1_000;
pub const DEFAULT_NAMESPACE: &str = "throttle";

pub const BASE_WEIGHT: u64 = 1;
pub const BOT_WEIGHT: u64 = 5;
pub const AI_WEIGHT: u64 = 10;

/// How `check()` guards the read-modify-write cycle on a client's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// No locking; concurrent requests from one client may overshoot the limits.
    #[default]
    BestEffort,
    /// Checks for the same IP are serialised within this process.
    Strict,
}

/// Base throttle settings. Only `limit` and `window_ms` are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ThrottleConfig {
    #[validate(range(min = 1, message = "limit must be greater than 0"))]
    pub limit: u64,

    #[validate(range(min = 1, message = "window_ms must be greater than 0"))]
    pub window_ms: u64,

    #[serde(default = "default_burst_limit")]
    #[validate(range(min = 1, message = "burst_limit must be greater than 0"))]
    pub burst_limit: u64,

    #[serde(default = "default_burst_window_ms")]
    #[validate(range(min = 1, message = "burst_window_ms must be greater than 0"))]
    pub burst_window_ms: u64,

    #[serde(default = "default_ban_threshold")]
    #[validate(range(min = 1, message = "ban_threshold must be greater than 0"))]
    pub ban_threshold: u32,

    #[serde(default = "default_ban_ms")]
    pub ban_ms: u64,

    #[serde(default = "default_violation_decay_ms")]
    pub violation_decay_ms: u64,

    #[serde(default = "default_ua_rotation_threshold")]
    #[validate(range(min = 1, message = "ua_rotation_threshold must be greater than 0"))]
    pub ua_rotation_threshold: usize,

    /// How long a user agent stays in an IP's rotation set after it was last seen.
    #[serde(default = "default_ua_retention_ms")]
    #[validate(range(min = 1, message = "ua_retention_ms must be greater than 0"))]
    pub ua_retention_ms: u64,

    #[serde(default = "default_namespace")]
    #[validate(length(min = 1, message = "namespace cannot be empty"))]
    pub namespace: String,

    #[serde(default)]
    pub consistency: Consistency,

    /// Upper bound on each individual state-store call.
    #[serde(default, with = "humantime_serde")]
    pub store_timeout: Option<Duration>,
}

fn default_burst_limit() -> u64 {
    DEFAULT_BURST_LIMIT
}

fn default_burst_window_ms() -> u64 {
    DEFAULT_BURST_WINDOW_MS
}

fn default_ban_threshold() -> u32 {
    DEFAULT_BAN_THRESHOLD
}

fn default_ban_ms() -> u64 {
    DEFAULT_BAN_MS
}

fn default_violation_decay_ms() -> u64 {
    DEFAULT_VIOLATION_DECAY_MS
}

fn default_ua_rotation_threshold() -> usize {
    DEFAULT_UA_ROTATION_THRESHOLD
}

fn default_ua_retention_ms() -> u64 {
    DEFAULT_UA_RETENTION_MS
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl ThrottleConfig {
    pub fn new(limit: u64, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            burst_limit: DEFAULT_BURST_LIMIT,
            burst_window_ms: DEFAULT_BURST_WINDOW_MS,
            ban_threshold: DEFAULT_BAN_THRESHOLD,
            ban_ms: DEFAULT_BAN_MS,
            violation_decay_ms: DEFAULT_VIOLATION_DECAY_MS,
            ua_rotation_threshold: DEFAULT_UA_ROTATION_THRESHOLD,
            ua_retention_ms: DEFAULT_UA_RETENTION_MS,
            namespace: default_namespace(),
            consistency: Consistency::default(),
            store_timeout: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            ThrottlerError::Configuration(format!("Failed to parse throttle config: {}", e))
        })?;
        config.validated()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "Loading throttle configuration");
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    pub fn with_burst(mut self, burst_limit: u64, burst_window_ms: u64) -> Self {
        self.burst_limit = burst_limit;
        self.burst_window_ms = burst_window_ms;
        self
    }

    pub fn with_ban(mut self, ban_threshold: u32, ban_ms: u64) -> Self {
        self.ban_threshold = ban_threshold;
        self.ban_ms = ban_ms;
        self
    }

    pub fn with_violation_decay(mut self, violation_decay_ms: u64) -> Self {
        self.violation_decay_ms = violation_decay_ms;
        self
    }

    pub fn with_ua_rotation(mut self, threshold: usize, retention_ms: u64) -> Self {
        self.ua_rotation_threshold = threshold;
        self.ua_retention_ms = retention_ms;
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }
}

/// Partial settings returned by a policy for one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOverride {
    pub limit: Option<u64>,
    pub window_ms: Option<u64>,
    pub burst_limit: Option<u64>,
    pub burst_window_ms: Option<u64>,
    pub ban_threshold: Option<u32>,
    pub ban_ms: Option<u64>,
    pub violation_decay_ms: Option<u64>,
    pub ua_rotation_threshold: Option<usize>,
    pub ua_retention_ms: Option<u64>,
    pub weight_multiplier: Option<f64>,
}

/// Settings in force for a single `check()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    pub limit: u64,
    pub window_ms: u64,
    pub burst_limit: u64,
    pub burst_window_ms: u64,
    pub ban_threshold: u32,
    pub ban_ms: u64,
    pub violation_decay_ms: u64,
    pub ua_rotation_threshold: usize,
    pub ua_retention_ms: u64,
    pub weight_multiplier: Option<f64>,
}

impl From<&ThrottleConfig> for EffectiveConfig {
    fn from(config: &ThrottleConfig) -> Self {
        Self {
            limit: config.limit,
            window_ms: config.window_ms,
            burst_limit: config.burst_limit,
            burst_window_ms: config.burst_window_ms,
            ban_threshold: config.ban_threshold,
            ban_ms: config.ban_ms,
            violation_decay_ms: config.violation_decay_ms,
            ua_rotation_threshold: config.ua_rotation_threshold,
            ua_retention_ms: config.ua_retention_ms,
            weight_multiplier: None,
        }
    }
}

impl EffectiveConfig {
    /// Shallow override: every field the override sets replaces the base value.
    pub fn apply(self, over: &ConfigOverride) -> Self {
        Self {
            limit: over.limit.unwrap_or(self.limit),
            window_ms: over.window_ms.unwrap_or(self.window_ms),
            burst_limit: over.burst_limit.unwrap_or(self.burst_limit),
            burst_window_ms: over.burst_window_ms.unwrap_or(self.burst_window_ms),
            ban_threshold: over.ban_threshold.unwrap_or(self.ban_threshold),
            ban_ms: over.ban_ms.unwrap_or(self.ban_ms),
            violation_decay_ms: over.violation_decay_ms.unwrap_or(self.violation_decay_ms),
            ua_rotation_threshold: over
                .ua_rotation_threshold
                .unwrap_or(self.ua_rotation_threshold),
            ua_retention_ms: over.ua_retention_ms.unwrap_or(self.ua_retention_ms),
            weight_multiplier: over.weight_multiplier.or(self.weight_multiplier),
        }
    }

    /// Cost of one request: 10 for AI agents, 5 for other bots, 1 otherwise,
    /// scaled by the multiplier and rounded up. Never less than 1.
    pub fn weight_for(&self, classification: &UaClassification) -> u64 {
        let base = if classification.is_ai {
            AI_WEIGHT
        } else if classification.is_bot {
            BOT_WEIGHT
        } else {
            BASE_WEIGHT
        };

        match self.weight_multiplier {
            Some(m) if m.is_finite() && m > 0.0 => ((base as f64) * m).ceil().max(1.0) as u64,
            _ => base,
        }
    }
}

pub fn merge(base: &ThrottleConfig, over: Option<&ConfigOverride>) -> EffectiveConfig {
    let effective = EffectiveConfig::from(base);
    match over {
        Some(over) => effective.apply(over),
        None => effective,
    }
}

/// Per-request override strategy: `(ip, user_agent, context) -> override`.
pub type Policy = Arc<dyn Fn(&str, &str, &RequestContext) -> Option<ConfigOverride> + Send + Sync>;

pub fn policy<F>(f: F) -> Policy
where
    F: Fn(&str, &str, &RequestContext) -> Option<ConfigOverride> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config = ThrottleConfig::from_json(r#"{"limit": 100, "window_ms": 60000}"#).unwrap();
        assert_eq!(config.burst_limit, 20);
        assert_eq!(config.burst_window_ms, 1_000);
        assert_eq!(config.ban_threshold, 5);
        assert_eq!(config.ban_ms, 86_400_000);
        assert_eq!(config.violation_decay_ms, 3_600_000);
        assert_eq!(config.ua_rotation_threshold, 5);
        assert_eq!(config.namespace, "throttle");
        assert_eq!(config.consistency, Consistency::BestEffort);
        assert_eq!(config.store_timeout, None);
    }

    #[test]
    fn test_missing_limit_rejected() {
        let err = ThrottleConfig::from_json(r#"{"window_ms": 60000}"#).unwrap_err();
        assert!(matches!(err, ThrottlerError::Configuration(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = ThrottleConfig::new(10, 0).validated().unwrap_err();
        assert!(matches!(err, ThrottlerError::Configuration(_)));
        assert!(err.to_string().contains("window_ms"));
    }

    #[test]
    fn test_zero_limit_rejected() {
        assert!(ThrottleConfig::new(0, 1000).validated().is_err());
    }

    #[test]
    fn test_store_timeout_humantime() {
        let config = ThrottleConfig::from_json(
            r#"{"limit": 1, "window_ms": 1, "store_timeout": "250ms", "consistency": "strict"}"#,
        )
        .unwrap();
        assert_eq!(config.store_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.consistency, Consistency::Strict);
    }

    #[test]
    fn test_merge_without_override_is_base() {
        let base = ThrottleConfig::new(5, 60_000);
        let effective = merge(&base, None);
        assert_eq!(effective, EffectiveConfig::from(&base));
    }

    #[test]
    fn test_merge_overrides_only_given_fields() {
        let base = ThrottleConfig::new(5, 60_000);
        let over = ConfigOverride {
            limit: Some(50),
            weight_multiplier: Some(2.0),
            ..ConfigOverride::default()
        };
        let effective = merge(&base, Some(&over));
        assert_eq!(effective.limit, 50);
        assert_eq!(effective.window_ms, 60_000);
        assert_eq!(effective.burst_limit, 20);
        assert_eq!(effective.weight_multiplier, Some(2.0));
    }

    #[test]
    fn test_weights() {
        let effective = EffectiveConfig::from(&ThrottleConfig::new(5, 1_000));
        let human = UaClassification::default();
        let bot = UaClassification {
            is_bot: true,
            ..UaClassification::default()
        };
        let ai = UaClassification {
            is_bot: true,
            is_ai: true,
            is_crawler: false,
        };
        assert_eq!(effective.weight_for(&human), 1);
        assert_eq!(effective.weight_for(&bot), 5);
        assert_eq!(effective.weight_for(&ai), 10);
    }

    #[test]
    fn test_weight_multiplier_rounds_up() {
        let mut effective = EffectiveConfig::from(&ThrottleConfig::new(5, 1_000));
        effective.weight_multiplier = Some(1.5);
        assert_eq!(effective.weight_for(&UaClassification::default()), 2);

        effective.weight_multiplier = Some(0.1);
        assert_eq!(effective.weight_for(&UaClassification::default()), 1);

        effective.weight_multiplier = Some(-3.0);
        assert_eq!(effective.weight_for(&UaClassification::default()), 1);
    }
}
