use crate::cache::{Cache, CacheBackend, CacheConfig};
use crate::config::ServerConfig;
use crate::error::{Result, ThrottlerError};
use crate::handlers::{
    get_throttle_status, health_check, index, metrics, readiness_check, reset_throttle, AppState,
};
use crate::middleware::{
    admin_auth_middleware, bypass_middleware, logging_middleware, throttle_middleware, BypassRules,
};
use crate::throttler::ThrottleEngine;
use axum::routing::get;
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub struct Server {
    app: Router,
    addr: SocketAddr,
    cache: Cache,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let throttle_config = config.throttle_config()?;
        let cache = connect_cache(&config).await?;
        let engine = Arc::new(ThrottleEngine::new(throttle_config, cache.clone())?);

        info!(
            backend = cache.backend(),
            limit = engine.config().limit,
            window_ms = engine.config().window_ms,
            failure_policy = ?config.failure_policy,
            trust_proxy_headers = config.trust_proxy_headers,
            "Throttle engine ready"
        );

        let mut state = AppState::new(engine, config.failure_policy)
            .with_trusted_proxy_headers(config.trust_proxy_headers);
        match config.admin_token.as_deref() {
            Some(token) => state = state.with_admin_token(token),
            None => info!("No admin token configured, admin endpoints disabled"),
        }
        let app = create_app(state, BypassRules::new(config.bypass_paths.clone()));

        Ok(Self {
            app,
            addr: config.bind_addr,
            cache,
        })
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!("Throttle server listening on {}", listener.local_addr()?);
        info!("Health check available at /health");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        self.cache.disconnect().await?;
        info!("Cache disconnected, server stopped");
        Ok(())
    }
}

/// Router with the throttle gate on application routes only; health and
/// metrics are never throttled, and admin routes exist only behind a token.
pub fn create_app(state: AppState, bypass: BypassRules) -> Router {
    let throttled = Router::new()
        .route("/", get(index))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            throttle_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            Arc::new(bypass),
            bypass_middleware,
        ));

    let mut operational = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics));

    if state.admin_token.is_some() {
        let admin = Router::new()
            .route(
                "/admin/throttle/:ip",
                get(get_throttle_status).delete(reset_throttle),
            )
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                admin_auth_middleware,
            ));
        operational = operational.merge(admin);
    }

    throttled
        .merge(operational)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware)),
        )
}

/// Connect the configured backend. An unreachable backend only takes the
/// cache down: unless `cache_required` is set, fall back to memory.
async fn connect_cache(config: &ServerConfig) -> Result<Cache> {
    let cache_config = config.cache_config();

    match Cache::from_config(&cache_config).await {
        Ok(cache) => Ok(cache),
        Err(ThrottlerError::AdapterConnection(msg))
            if !config.cache_required && cache_config.backend != CacheBackend::Memory =>
        {
            error!(error = %msg, "Cache backend unreachable");
            warn!("Falling back to in-memory cache; throttle state is local to this process");
            Cache::from_config(&CacheConfig {
                backend: CacheBackend::Memory,
                ..cache_config
            })
            .await
        }
        Err(err) => Err(err),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
