//! Token Broker
//!
//! Single-binary service that:
//! 1. Holds one refresh token for a project on the auth server
//! 2. Serves short-lived access tokens from a shared session
//! 3. Coalesces concurrent refreshes and rate-limits forced ones

mod broker;
mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use session::{AccessToken, HttpRefresher, RefreshToken, Session, SessionState};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::broker::{Broker, RetryPolicy};
use crate::config::{CLIENT_KEY_ENV, Config, REFRESH_TOKEN_ENV};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    broker: Broker,
    prometheus: PrometheusHandle,
    requests_total: Arc<AtomicU64>,
    started_at: Instant,
}

impl AppState {
    fn new(broker: Broker, prometheus: PrometheusHandle) -> Self {
        Self {
            broker,
            prometheus,
            requests_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Build the axum router with all routes and shared state, capped at
/// `max_connections` concurrent requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/token", get(token_handler))
        .route("/token/refresh", post(refresh_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting token-broker");

    // Install before any metrics are emitted
    let prometheus_handle = metrics::install_recorder()?;

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
        listen_addr = %config.broker.listen_addr,
        base_url = %config.auth.base_url,
        project_id = %config.auth.project_id,
        max_connections = config.broker.max_connections,
        "configuration loaded"
    );

    let refresh_token = config.auth.refresh_token.clone().with_context(|| {
        format!("no refresh token: set {REFRESH_TOKEN_ENV} or auth.refresh_token_file")
    })?;
    let client_key = config
        .auth
        .client_key
        .clone()
        .with_context(|| format!("no publishable client key: set {CLIENT_KEY_ENV}"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.auth.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let refresher = HttpRefresher::new(
        client,
        &config.auth.base_url,
        config.auth.project_id.clone(),
        client_key,
    );
    let session = Session::new(
        Arc::new(refresher),
        Some(RefreshToken::from(refresh_token)),
        None,
    );

    let sinks = async_state::ErrorSinks::new();
    // Held until shutdown.
    let _log_sink = sinks.register(|location, err| {
        error!(location, error = %err, "background task failed");
        metrics::record_background_error(location);
    });

    let broker = Broker::new(
        session,
        RetryPolicy::from(&config.retry),
        config.cache.cache_options(),
        sinks,
    );

    let app = build_router(
        AppState::new(broker, prometheus_handle),
        config.broker.max_connections,
    );

    let listen_addr = config.broker.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

fn token_body(token: &AccessToken) -> serde_json::Value {
    serde_json::json!({
        "access_token": token.as_str(),
        "token_type": "Bearer",
        "expires_in": token.expires_at().map(|_| token.expires_in().as_secs()),
    })
}

/// Shared tail of the token endpoints: render, count, time.
fn token_response(
    state: &AppState,
    endpoint: &'static str,
    started: Instant,
    outcome: error::Result<AccessToken>,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let response = match outcome {
        Ok(token) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            token_body(&token).to_string(),
        )
            .into_response(),
        Err(e) => {
            warn!(endpoint, error = %e, "token request failed");
            e.into_response()
        }
    };
    metrics::record_request(
        endpoint,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Cached or refreshed access token. 401 once the session is invalid,
/// 502 when the token endpoint keeps failing.
async fn token_handler(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let outcome = state.broker.token().await;
    token_response(&state, "token", started, outcome)
}

/// Force a new access token. Bursts share one refresh.
async fn refresh_handler(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let outcome = state.broker.force_refresh().await;
    token_response(&state, "token_refresh", started, outcome)
}

/// Session state, uptime and requests served. 503 once the session is invalid.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let session_state = state.broker.state();
    let (status_code, status) = match session_state {
        SessionState::Invalid => (StatusCode::SERVICE_UNAVAILABLE, "unhealthy"),
        _ => (StatusCode::OK, "healthy"),
    };
    let body = serde_json::json!({
        "status": status,
        "session": session_state.label(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": state.requests_total.load(Ordering::Relaxed),
    });
    (
        status_code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
