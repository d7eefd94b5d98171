//! Gemini Relay
//!
//! Single-binary Rust service that:
//! 1. Accepts `POST /api/gemini` with `{"prompt": "..."}`
//! 2. Enforces local per-minute and per-day request quotas
//! 3. Calls the Gemini `generateContent` API, retrying on overload
//! 4. Returns the reply text or a classified JSON error

mod config;
mod error;
mod metrics;
mod relay;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use quota::QuotaTracker;
use upstream::{GeminiClient, TokioSleeper};

use crate::config::Config;
use crate::relay::RelayState;

/// Maximum time to wait for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    relay: RelayState,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    prometheus: PrometheusHandle,
}

impl AppState {
    fn new(relay: RelayState, prometheus: PrometheusHandle) -> Self {
        Self {
            relay,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            prometheus,
        }
    }
}

/// Build the axum router with all routes and shared state.
///
/// Browsers call the relay cross-origin, so CORS is open. The concurrency
/// limit queues excess requests rather than rejecting them.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/api/gemini", post(relay_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
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

    info!("starting gemini-relay");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install metrics recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let (config, config_path) =
        Config::load_resolved(cli_config_path).context("failed to load configuration")?;
    match &config_path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no config file found, using defaults and environment"),
    }

    let api_key = config
        .api_key()
        .context("GEMINI_API_KEY is not set and no api_key_file is configured")?;
    let limits = config.quota_limits().context("invalid quota limits")?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_timeout_secs = ?config.upstream.timeout_secs,
        max_retries = config.retry.max_retries,
        requests_per_minute = limits.requests_per_minute,
        requests_per_day = limits.requests_per_day,
        prompt_prefix = config.upstream.prompt_prefix.is_some(),
        "relay configured"
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let gemini = GeminiClient::new(client, config.upstream.url.clone(), api_key)
        .with_timeout(config.upstream_timeout())
        .with_prompt_prefix(config.upstream.prompt_prefix.clone());

    let relay_state = RelayState::new(
        Arc::new(QuotaTracker::new(limits)),
        Arc::new(gemini),
        config.retry_policy(),
        Arc::new(TokioSleeper),
    );
    let app = build_router(
        AppState::new(relay_state, prometheus_handle),
        config.server.max_connections,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: notify the
    // server to drain, then race the drain against the timer.
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
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, uptime, counters and the current quota windows.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let relay = &state.relay;
    let body = serde_json::json!({
        "status": "healthy",
        "started_at": state.started_at_utc.to_rfc3339(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "requests_served": relay.requests_total.load(Ordering::Relaxed),
        "errors_total": relay.errors_total.load(Ordering::Relaxed),
        "upstream": relay.upstream.id(),
        "quota": relay.tracker.snapshot(),
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

/// Relay one prompt. The body is taken raw, and its rejection kept, so
/// malformed or unreadable bodies map to `missing_prompt` JSON instead of
/// axum's plain-text rejection.
async fn relay_handler(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    relay::relay_prompt(&state.relay, body, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
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
            Ok(mut sig) => {
                sig.recv().await;
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
