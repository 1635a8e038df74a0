// HTTP server for the generation endpoint
//
// Routes:
// - POST /generate-data  streamed, metered token generation
// - GET  /user/stats     quota inspection
// - GET  /health         dependency liveness
// - GET  /metrics        Prometheus scrape target

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::handlers;
use crate::config::{BackendKind, Config, StreamConfig};
use crate::coordinator::{SessionCoordinator, StageTimeout};
use crate::metrics;
use crate::quota::{LocalCache, MemoryStore, QuotaCache, QuotaLedger, QuotaStore, RedisCache, RedisStore};
use crate::rate_limit::RateLimiter;
use crate::stream::StreamSession;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: SessionCoordinator,
    pub stream: StreamConfig,
    /// Cancelled on shutdown; every stream runs under a child token
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(coordinator: SessionCoordinator, stream: StreamConfig) -> Self {
        Self {
            coordinator,
            stream,
            shutdown: CancellationToken::new(),
        }
    }

    /// Wire the limiter, ledger and coordinator from configuration
    ///
    /// Must be called inside a tokio runtime; the limiter starts its sweep here.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let (store, cache): (Arc<dyn QuotaStore>, Arc<dyn QuotaCache>) = match config.backend.kind {
            BackendKind::Memory => (
                Arc::new(MemoryStore::new()),
                Arc::new(LocalCache::new(
                    config.quota.cache_capacity,
                    config.quota.cache_ttl(),
                )),
            ),
            BackendKind::Redis => {
                let url = config.backend.redis_url.as_str();
                let store = RedisStore::connect(url)
                    .await
                    .with_context(|| format!("Failed to connect quota store to {}", url))?;
                let cache = RedisCache::connect(url)
                    .await
                    .with_context(|| format!("Failed to connect quota cache to {}", url))?;
                (Arc::new(store), Arc::new(cache))
            }
        };

        let ledger = Arc::new(QuotaLedger::with_settings(
            store,
            cache,
            config.quota.ledger_settings(),
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let coordinator = SessionCoordinator::new(
            limiter,
            ledger,
            StreamSession::new(config.stream.pacing()),
            StageTimeout::new(config.quota.reconcile_timeout()),
        );

        info!(
            backend = ?config.backend.kind,
            rate_limit = config.rate_limit.requests_per_window,
            rate_limit_enabled = config.rate_limit.enabled,
            "Service state initialized"
        );

        Ok(Self::new(coordinator, config.stream.clone()))
    }
}

/// Build the router
pub fn router(state: AppState, metrics_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/generate-data", post(handlers::generate_data))
        .route("/user/stats", get(handlers::user_stats))
        .route("/health", get(handlers::health));

    if metrics_enabled {
        app = app.route("/metrics", get(handlers::metrics_handler));
    }

    // Browser clients on any origin may call the API
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until SIGINT/SIGTERM, then drain streams and reconciliations
pub async fn serve(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::init() {
            warn!("Metrics already registered: {}", e);
        }
    }

    let state = AppState::from_config(&config).await?;
    let app = router(state.clone(), config.metrics.enabled);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // End in-flight streams so their connections can close
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    let drained = state
        .coordinator
        .shutdown(config.server.shutdown_timeout())
        .await;
    if drained {
        info!("Shutdown complete");
    } else {
        warn!("Shutdown finished with reconciliations still pending");
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
