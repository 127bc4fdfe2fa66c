use crate::cache::{CacheBackend, CacheConfig};
use crate::error::{Result, ThrottlerError};
use crate::throttle_config::ThrottleConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// What the pipeline does when the state store fails during a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through.
    Open,
    /// Answer 503.
    #[default]
    Closed,
}

/// Process configuration. Every flag can also be set from the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "adaptive-throttle", version, about)]
pub struct ServerConfig {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Log level for this crate
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// State store backend
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value_t = CacheBackend::Memory)]
    pub cache_backend: CacheBackend,

    /// Redis connection URL, used by the redis backend
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Prefix applied to every key written to Redis
    #[arg(long, env = "REDIS_KEY_PREFIX", default_value = "")]
    pub redis_key_prefix: String,

    /// Maximum entries held by the memory backend
    #[arg(long, env = "CACHE_MAX_ENTRIES", default_value_t = 10_000)]
    pub cache_max_entries: usize,

    /// Expired-entry sweep interval in seconds (0 disables the sweeper)
    #[arg(long, env = "CACHE_SWEEP_INTERVAL", default_value_t = 60)]
    pub cache_sweep_interval_secs: u64,

    /// Abort startup instead of falling back to memory when the backend is unreachable
    #[arg(long, env = "CACHE_REQUIRED")]
    pub cache_required: bool,

    /// Behaviour when a throttle check fails on the state store
    #[arg(long, env = "FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::Closed)]
    pub failure_policy: FailurePolicy,

    /// JSON file with the full throttle configuration
    #[arg(long = "throttle-config", env = "THROTTLE_CONFIG")]
    pub throttle_config_path: Option<PathBuf>,

    /// Maximum weighted hits per window (ignored with --throttle-config)
    #[arg(long, env = "THROTTLE_LIMIT", default_value_t = 100)]
    pub limit: u64,

    /// Sliding window length in milliseconds (ignored with --throttle-config)
    #[arg(long, env = "THROTTLE_WINDOW_MS", default_value_t = 60_000)]
    pub window_ms: u64,

    /// Key namespace for throttle records (ignored with --throttle-config)
    #[arg(long, env = "THROTTLE_NAMESPACE", default_value = "throttle")]
    pub namespace: String,

    /// Bearer token for the admin endpoints; they are not mounted when unset
    #[arg(long, env = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Take the client IP from X-Forwarded-For / X-Real-IP / CF-Connecting-IP.
    /// Only enable behind a proxy that overwrites these headers.
    #[arg(long, env = "TRUST_PROXY_HEADERS")]
    pub trust_proxy_headers: bool,

    /// Path prefixes that skip throttling
    #[arg(long = "bypass-path", env = "THROTTLE_BYPASS_PATHS", value_delimiter = ',')]
    pub bypass_paths: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["adaptive-throttle"])
    }
}

impl ServerConfig {
    /// Load configuration from command-line arguments and environment variables
    pub fn from_env() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_backend == CacheBackend::Redis {
            validate_redis_url(&self.redis_url)?;
        }

        if self.cache_max_entries == 0 {
            return Err(ThrottlerError::Configuration(
                "Cache max entries must be greater than 0".to_string(),
            ));
        }

        if self.admin_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ThrottlerError::Configuration(
                "Admin token cannot be blank".to_string(),
            ));
        }

        if self.bypass_paths.iter().any(|p| !p.starts_with('/')) {
            return Err(ThrottlerError::Configuration(
                "Bypass paths must start with '/'".to_string(),
            ));
        }

        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            backend: self.cache_backend,
            redis_url: self.redis_url.clone(),
            max_entries: self.cache_max_entries,
            sweep_interval: (self.cache_sweep_interval_secs > 0)
                .then(|| Duration::from_secs(self.cache_sweep_interval_secs)),
            key_prefix: self.redis_key_prefix.clone(),
        }
    }

    pub fn throttle_config(&self) -> Result<ThrottleConfig> {
        match &self.throttle_config_path {
            Some(path) => ThrottleConfig::from_file(path),
            None => ThrottleConfig::new(self.limit, self.window_ms)
                .with_namespace(&self.namespace)
                .validated(),
        }
    }

    pub fn log_filter(&self) -> String {
        format!("adaptive_throttle={},tower_http=debug", self.log_level)
    }
}

pub fn validate_redis_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(ThrottlerError::Configuration(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(ThrottlerError::Configuration(
            "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
        ));
    }

    Ok(())
}
