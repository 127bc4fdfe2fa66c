use axum::{
    extract::{Extension, Path, State},
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use crate::config::FailurePolicy;
use crate::context::RequestContext;
use crate::error::ThrottlerError;
use crate::metrics::MetricsCollector;
use crate::response::{HealthResponse, ResetResponse};
use crate::throttler::{ThrottleEngine, ThrottleResult};

static START_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

const HEALTH_CHECK_KEY: &str = "__health__";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ThrottleEngine>,
    pub metrics: MetricsCollector,
    pub failure_policy: FailurePolicy,
    /// Admin routes are only mounted when this is set.
    pub admin_token: Option<Arc<str>>,
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(engine: Arc<ThrottleEngine>, failure_policy: FailurePolicy) -> Self {
        LazyLock::force(&START_TIME);
        Self {
            engine,
            metrics: MetricsCollector::new(),
            failure_policy,
            admin_token: None,
            trust_proxy_headers: false,
        }
    }

    pub fn with_admin_token(mut self, token: &str) -> Self {
        self.admin_token = Some(Arc::from(token));
        self
    }

    pub fn with_trusted_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

/// Sample application route sitting behind the throttle gate
pub async fn index(
    context: Option<Extension<RequestContext>>,
    result: Option<Extension<ThrottleResult>>,
) -> impl IntoResponse {
    let classification = result.and_then(|Extension(r)| r.ua_classification);
    let path = context.and_then(|Extension(c)| c.path);
    Json(serde_json::json!({
        "status": "ok",
        "path": path,
        "ua_classification": classification,
    }))
}

async fn check_cache(state: &AppState) -> (bool, u64) {
    let start = Instant::now();
    let connected = state.engine.cache().has(HEALTH_CHECK_KEY).await.is_ok();
    (connected, start.elapsed().as_millis() as u64)
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let (connected, elapsed_ms) = check_cache(&state).await;

    Json(HealthResponse::new(
        state.engine.cache().backend(),
        connected,
        elapsed_ms,
        START_TIME.elapsed().as_secs(),
    ))
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let (connected, _) = check_cache(&state).await;
    let backend = state.engine.cache().backend();

    if connected {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ready", "cache": backend })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "cache": backend })),
        )
    }
}

/// Decision counters
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot().await)
}

/// Stored throttle state for an IP, for the caller's User-Agent
pub async fn get_throttle_status(
    State(state): State<AppState>,
    Path(ip): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ThrottlerError> {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if ip.trim().is_empty() {
        return Err(ThrottlerError::Validation("ip is required".to_string()));
    }

    let status = state.engine.status(&ip, user_agent).await?;
    Ok(Json(status))
}

/// Drop every record, rotation set and ban for an IP
pub async fn reset_throttle(
    State(state): State<AppState>,
    Path(ip): Path<String>,
) -> Result<impl IntoResponse, ThrottlerError> {
    if ip.trim().is_empty() {
        return Err(ThrottlerError::Validation("ip is required".to_string()));
    }

    let removed = state.engine.reset(&ip).await?;
    tracing::info!(ip = %ip, removed = removed, "Throttle state reset via admin endpoint");
    Ok(Json(ResetResponse::new(&ip, removed)))
}
