//! Bearer Auth Proxy
//!
//! Single-binary Rust service that:
//! 1. Holds one login session (access + refresh token) on behalf of its clients
//! 2. Listens for incoming requests
//! 3. Forwards them upstream with `Authorization: Bearer <access token>`
//! 4. Refreshes the token once when upstream reports it expired, sharing a
//!    single refresh among all requests that hit the expiry together

mod auth;
mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use auth_client::{AuthClient, ClientConfig, ReqwestTransport, Session, SessionConfig};
use auth_refresh::RefreshCoordinator;
use auth_store::{CredentialStore, FileStore, MemoryStore};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{AuthConfig, Config};
use crate::proxy::ProxyState;

/// Time allowed for in-flight requests to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    session: Arc<Session>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// The concurrency limit queues requests beyond `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(auth::build_auth_router::<AppState>(state.session.clone()))
        .fallback(proxy_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Open the configured credential store and apply env-supplied tokens.
async fn open_store(auth: &AuthConfig) -> error::Result<Arc<dyn CredentialStore>> {
    let store: Arc<dyn CredentialStore> = match &auth.credentials_file {
        Some(path) => Arc::new(
            FileStore::load(path.clone())
                .await
                .map_err(|e| error::Error::CredentialStore(e.to_string()))?,
        ),
        None => {
            info!("no credentials_file configured, tokens are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    match (&auth.seed.access, &auth.seed.refresh) {
        (Some(access), refresh) => {
            store
                .set(access.clone(), refresh.clone())
                .await
                .map_err(|e| error::Error::CredentialStore(e.to_string()))?;
            info!(
                has_refresh = refresh.is_some(),
                "seeded credential store from environment"
            );
        }
        (None, Some(_)) => warn!("REFRESH_TOKEN ignored: ACCESS_TOKEN is not set"),
        (None, None) => {}
    }

    Ok(store)
}

/// Wire store, coordinator, session and client together.
async fn build_state(
    config: &Config,
    store: Arc<dyn CredentialStore>,
    prometheus: PrometheusHandle,
) -> error::Result<AppState> {
    let default_headers = config.default_headers()?;
    let http = reqwest::Client::new();
    let coordinator = RefreshCoordinator::with_timeout(store, http.clone(), config.refresh_timeout());

    let session = Session::new(
        SessionConfig {
            login_url: config.auth.login_url.clone(),
            refresh_url: config.auth.refresh_url.clone(),
            expiry_status: config.auth.expiry_status_code,
        },
        coordinator.clone(),
        http.clone(),
    );
    let authenticated = session
        .restore()
        .await
        .map_err(|e| error::Error::Session(e.to_string()))?;
    if !authenticated {
        info!("no stored access token, POST /auth/login to start a session");
    }

    let client_config = ClientConfig {
        base_url: Some(config.proxy.upstream_url.clone()),
        default_headers,
    };
    let transport = ReqwestTransport::with_timeout(http, config.upstream_timeout());
    let client = AuthClient::new(Arc::new(transport), coordinator, client_config);

    Ok(AppState {
        proxy: ProxyState {
            client,
            timeout: config.upstream_timeout(),
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
        },
        session: Arc::new(session),
        started_at: Instant::now(),
        prometheus,
    })
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

    info!("starting bearer-auth-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().map_err(|e| error::Error::Metrics(e.to_string()))?;

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
        listen_addr = %config.proxy.listen_addr,
        upstream_url = %config.proxy.upstream_url,
        login_url = %config.auth.login_url,
        refresh_enabled = config.auth.refresh_url.is_some(),
        expiry_status_code = config.auth.expiry_status_code,
        headers = config.headers.len(),
        "configuration loaded"
    );

    let store = open_store(&config.auth)
        .await
        .context("failed to open credential store")?;
    let state = build_state(&config, store, prometheus_handle)
        .await
        .context("failed to initialise session")?;

    let coordinator = state.proxy.client.coordinator().clone();
    let in_flight = state.proxy.in_flight.clone();
    let listen_addr = config.proxy.listen_addr;
    let app = build_router(state, config.proxy.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts at signal receipt: notify the server to drain,
    // then race the drain against the timeout.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
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
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if coordinator.cancel().await {
        info!("cancelled in-flight token refresh");
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: liveness plus session state. Never exposes tokens.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session = state.session.status().await;
    let body = serde_json::json!({
        "status": "healthy",
        "authenticated": session.authenticated,
        "refreshing": session.refreshing,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.proxy.requests_total.load(Ordering::Relaxed),
        "errors_total": state.proxy.errors_total.load(Ordering::Relaxed),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
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

/// Catch-all handler that proxies everything else upstream.
async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
