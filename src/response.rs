use crate::throttler::ThrottleReason;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Body of every 429 the throttle gate emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottledResponse {
    pub error: String,
    pub reason: ThrottleReason,
}

impl ThrottledResponse {
    pub fn new(reason: ThrottleReason) -> Self {
        Self {
            error: "throttled".to_string(),
            reason,
        }
    }
}

impl IntoResponse for ThrottledResponse {
    fn into_response(self) -> Response {
        (StatusCode::TOO_MANY_REQUESTS, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub cache_backend: String,
    pub cache_connected: bool,
    pub cache_response_time_ms: u64,
}

impl HealthResponse {
    pub fn new(
        cache_backend: &str,
        cache_connected: bool,
        cache_response_time_ms: u64,
        uptime_seconds: u64,
    ) -> Self {
        Self {
            status: if cache_connected { "healthy" } else { "degraded" }.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            cache_backend: cache_backend.to_string(),
            cache_connected,
            cache_response_time_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: String,
    pub ip: String,
    pub removed: usize,
}

impl ResetResponse {
    pub fn new(ip: &str, removed: usize) -> Self {
        Self {
            status: "success".to_string(),
            ip: ip.to_string(),
            removed,
        }
    }
}
