use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::FailurePolicy;
use crate::context::RequestContext;
use crate::error::ThrottlerError;
use crate::handlers::AppState;
use crate::identity::extract_client_ip;
use crate::response::ThrottledResponse;
use crate::throttler::ThrottleReason;

/// Path prefixes whose requests are marked as bypassing the throttle.
#[derive(Debug, Clone, Default)]
pub struct BypassRules {
    prefixes: Vec<String>,
}

impl BypassRules {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

/// Upstream stage: flags matching requests in their [`RequestContext`].
pub async fn bypass_middleware(
    State(rules): State<Arc<BypassRules>>,
    mut request: Request,
    next: Next,
) -> Response {
    if rules.matches(request.uri().path()) {
        let mut context = request
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default();
        context.bypass = true;
        request.extensions_mut().insert(context);
    }

    next.run(request).await
}

/// Throttle gate: 429 on denial, otherwise the verdict is attached to the
/// request extensions and the request continues.
pub async fn throttle_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request, state.trust_proxy_headers).unwrap_or_default();
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut context = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .unwrap_or_default();
    if context.path.is_none() {
        context.path = Some(request.uri().path().to_string());
    }
    if context.method.is_none() {
        context.method = Some(request.method().to_string());
    }

    match state.engine.check(&ip, &user_agent, &context).await {
        Ok(result) => {
            state.metrics.record(&result).await;

            if result.restricted {
                let reason = result.reason.unwrap_or(ThrottleReason::InvalidIdentity);
                info!(
                    target: "adaptive_throttle::middleware",
                    client_ip = %ip,
                    reason = %reason,
                    "Request throttled"
                );
                return ThrottledResponse::new(reason).into_response();
            }

            request.extensions_mut().insert(context);
            request.extensions_mut().insert(result);
            next.run(request).await
        }
        Err(err) => {
            state.metrics.record_store_error().await;
            match state.failure_policy {
                FailurePolicy::Open => {
                    warn!(
                        target: "adaptive_throttle::middleware",
                        client_ip = %ip,
                        error = %err,
                        "Throttle check failed, letting request through"
                    );
                    request.extensions_mut().insert(context);
                    next.run(request).await
                }
                FailurePolicy::Closed => err.into_response(),
            }
        }
    }
}

/// Admin gate: requires `Authorization: Bearer <admin token>`.
pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return ThrottlerError::Unauthorized("admin access disabled".into()).into_response();
    };

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| tokens_match(token.trim(), expected));

    if !authorized {
        warn!(
            target: "adaptive_throttle::middleware",
            uri = %request.uri(),
            "Rejected admin request"
        );
        return ThrottlerError::Unauthorized("invalid admin token".into()).into_response();
    }

    next.run(request).await
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let peer_ip = client_ip(&request, false).unwrap_or_else(|| "unknown".to_string());

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        request.headers_mut().insert("x-request-id", value);
    }

    info!(
        target: "adaptive_throttle::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        peer_ip = %peer_ip,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "adaptive_throttle::middleware",
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %status,
        "Request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Socket peer address, or the proxy-reported client when proxy headers are trusted.
fn client_ip(request: &Request, trust_proxy_headers: bool) -> Option<String> {
    let forwarded = if trust_proxy_headers {
        extract_client_ip(request.headers())
    } else {
        None
    };

    forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    })
}
