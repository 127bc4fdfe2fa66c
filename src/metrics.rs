use crate::throttler::ThrottleResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub bypassed_requests: u64,
    pub store_errors: u64,
    pub by_reason: HashMap<String, u64>,
    pub since: u64,
}

impl Default for ThrottleMetrics {
    fn default() -> Self {
        Self {
            total_requests: 0,
            allowed_requests: 0,
            throttled_requests: 0,
            bypassed_requests: 0,
            store_errors: 0,
            by_reason: HashMap::new(),
            since: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<ThrottleMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, result: &ThrottleResult) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;

        if result.bypassed {
            metrics.bypassed_requests += 1;
        } else if result.restricted {
            metrics.throttled_requests += 1;
        } else {
            metrics.allowed_requests += 1;
        }

        if let Some(reason) = result.reason {
            *metrics.by_reason.entry(reason.to_string()).or_default() += 1;
        }
    }

    pub async fn record_store_error(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.store_errors += 1;
    }

    pub async fn snapshot(&self) -> ThrottleMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.metrics.write().await = ThrottleMetrics::default();
    }
}
