//! OAuth2 Gateway
//!
//! Single-binary Rust service that:
//! 1. Registers one authorization flow per configured provider
//! 2. Serves the login redirect and provider callback routes
//! 3. Exposes an admin API to trigger authentications and drop credentials
//! 4. Expires abandoned login requests in the background

mod admin;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use oauth2_flow::{
    FileStore, FlowRegistry, KeyValueStore, LogNotifier, MemoryStore, Notifier, WebhookNotifier,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;

/// Time allowed for in-flight requests to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for outbound calls to token endpoints and the notifier webhook.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the health and metrics handlers
#[derive(Clone)]
struct AppState {
    registry: Arc<FlowRegistry>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router: flow routes, admin API, health and metrics.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let flows = state.registry.router();
    let admin = build_admin_router(AdminState::new(state.registry.clone()));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(flows)
        .merge(admin)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting oauth2-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder()?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        public_url = %config.server.public_url,
        providers = config.providers.len(),
        pending_ttl_secs = config.pending.ttl_secs,
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;

    let backend: Arc<dyn KeyValueStore> = match &config.store.path {
        Some(path) => Arc::new(
            FileStore::load(path.clone())
                .await
                .with_context(|| format!("failed to load credential store {}", path.display()))?,
        ),
        None => {
            warn!("no store path configured, credentials will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let notifier: Arc<dyn Notifier> = match &config.notifier.webhook_url {
        Some(url) => {
            info!(webhook_url = %url, "delivering login prompts via webhook");
            Arc::new(WebhookNotifier::new(http.clone(), url.clone()))
        }
        None => {
            warn!("no notifier webhook configured, login prompts are only logged");
            Arc::new(LogNotifier)
        }
    };

    let mut registry =
        FlowRegistry::new(backend, notifier, http).with_pending_ttl(config.pending.ttl());
    for provider in config.provider_configs() {
        // Rejected providers are logged by the registry; the rest still start
        let _ = registry.register(provider);
    }
    if registry.providers().is_empty() {
        warn!("no oauth2 providers registered");
    }
    let registry = Arc::new(registry);

    let sweep_handle = registry.spawn_sweep_task(config.pending.sweep_interval());

    let app_state = AppState {
        registry,
        prometheus,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    sweep_handle.abort();

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: registered providers, parked logins and uptime.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state.registry.providers();
    let pending: usize = providers
        .iter()
        .filter_map(|name| state.registry.flow(name))
        .map(|flow| flow.pending().len())
        .sum();

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "status": "healthy",
            "providers": providers,
            "pending_authentications": pending,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        })
        .to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// If a handler cannot be installed, that signal source never fires and
/// the other one still does.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
