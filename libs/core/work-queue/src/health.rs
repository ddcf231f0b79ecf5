//! Health endpoints for K8s probes.

use crate::connection::ConnectionState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::info;

/// Health status of the consumer process.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub connection: String,
    pub processed_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared health state.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthStateInner>>,
    connection: Option<watch::Receiver<ConnectionState>>,
}

struct HealthStateInner {
    terminated: bool,
    processed_total: u64,
    last_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthStateInner {
                terminated: false,
                processed_total: 0,
                last_error: None,
            })),
            connection: None,
        }
    }

    /// Track readiness against a connection's state.
    pub fn with_connection(mut self, connection: watch::Receiver<ConnectionState>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub async fn set_processed(&self, total: u64) {
        let mut inner = self.inner.write().await;
        inner.processed_total = total;
    }

    /// Mark the pull loop as terminated because of `error`.
    pub async fn set_terminated(&self, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.terminated = true;
        inner.last_error = Some(error.into());
    }

    fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(ConnectionState::Connected)
    }

    /// Liveness: a reconnecting client is still alive, a terminated loop is not.
    pub async fn is_alive(&self) -> bool {
        let inner = self.inner.read().await;
        !inner.terminated && self.connection_state() != ConnectionState::Failed
    }

    /// Readiness: alive and currently connected.
    pub async fn is_ready(&self) -> bool {
        self.is_alive().await && self.connection_state() == ConnectionState::Connected
    }

    pub async fn status(&self) -> HealthStatus {
        let connection = self.connection_state();
        let inner = self.inner.read().await;
        let status = if inner.terminated || connection == ConnectionState::Failed {
            "unhealthy"
        } else if connection == ConnectionState::Connected {
            "healthy"
        } else {
            "degraded"
        };
        HealthStatus {
            status: status.to_string(),
            connection: format!("{connection:?}").to_lowercase(),
            processed_total: inner.processed_total,
            last_error: inner.last_error.clone(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Health server for K8s probes.
pub struct HealthServer {
    port: u16,
    state: HealthState,
    metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl HealthServer {
    pub fn new(port: u16, state: HealthState) -> Self {
        Self {
            port,
            state,
            metrics_handle: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    pub fn state(&self) -> HealthState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .with_state(self.state.clone());

        if let Some(handle) = self.metrics_handle.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = format!("0.0.0.0:{}", self.port);

        info!(addr = %addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.status().await;
    if state.is_alive().await {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let status = state.status().await;
    if state.is_ready().await {
        (StatusCode::OK, Json(status))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(status))
    }
}
