use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::registry::{EntrySnapshot, Registry};
use crate::relay::websocket_handler;

/// Silence allowed on a connection before it is dropped, unless configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub metrics: Option<PrometheusHandle>,
    pub idle_timeout: Duration,
}

impl AppState {
    pub fn new(registry: Registry, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            registry,
            metrics,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    registered_identities: usize,
    entries: Vec<EntrySnapshot>,
}

pub fn build_router(state: AppState, signal_path: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route(signal_path, get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: AppState,
    signal_path: &str,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state, signal_path);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let registry = Registry::new();
    let reaper = registry.spawn_reaper(config.idle_timeout(), config.heartbeat_interval);
    let state = AppState::new(registry, metrics).with_idle_timeout(config.idle_timeout());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        path = %config.signal_path,
        "rendezvous server listening"
    );

    serve(listener, state, &config.signal_path, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    reaper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let entries = state.registry.snapshot();
    Json(StatsResponse {
        registered_identities: entries.len(),
        entries,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
