//! Health Check Server - Liveness, Readiness and Service Health
//!
//! Exposes /live, /ready and /health via axum 0.7 for Docker health
//! checks and monitoring. /health reports the aggregated provider health
//! with a copy of every circuit breaker and retry counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::domain::health::HealthStatus;
use crate::ports::telemetry::PipelineObserver;
use crate::usecases::registry::SubscriptionRegistry;
use crate::usecases::resilience::{HealthSnapshot, ResilienceWrapper};

/// Shared state read by the health endpoints.
pub struct HealthState {
    resilience: Arc<ResilienceWrapper>,
    registry: Arc<SubscriptionRegistry>,
    /// Cleared when shutdown begins.
    accepting: AtomicBool,
}

impl HealthState {
    pub fn new(resilience: Arc<ResilienceWrapper>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            resilience,
            registry,
            accepting: AtomicBool::new(true),
        }
    }

    /// Check if the service should receive traffic.
    pub fn is_ready(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Flip readiness off; /ready answers 503 from now on.
    pub fn begin_shutdown(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    /// Build the /health body.
    pub fn report(&self) -> HealthReport {
        let snapshot = self.resilience.health_snapshot();
        HealthReport {
            status: snapshot.status(),
            snapshot,
            connections: self.registry.connection_count(),
            subscriptions: self.registry.subscription_count(),
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
    pub connections: usize,
    pub subscriptions: usize,
}

/// Axum-based health check HTTP server.
///
/// Serves liveness (/live), readiness (/ready) and service health
/// (/health) for Docker health checks and orchestrator probes.
pub struct HealthServer {
    /// Health state shared with all components.
    state: Arc<HealthState>,
    /// Bind port (default 8080 from config).
    port: u16,
}

impl HealthServer {
    /// Create a new health server.
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Routes, split out so tests can drive them without a socket.
    pub fn router(state: Arc<HealthState>) -> Router {
        Router::new()
            .route("/live", get(Self::liveness))
            .route("/ready", get(Self::readiness))
            .route("/health", get(Self::health))
            .with_state(state)
    }

    /// Start the health check server.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let app = Self::router(Arc::clone(&self.state));

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!(address = %addr, "Health server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Liveness probe: always returns 200 if the process is running.
    async fn liveness() -> impl IntoResponse {
        (StatusCode::OK, "OK")
    }

    /// Readiness probe: 200 until shutdown begins.
    async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
        if state.is_ready() {
            (StatusCode::OK, "READY")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }

    /// Service health: 503 only when Unhealthy.
    async fn health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
        let report = state.report();
        let code = match report.status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        };
        (code, Json(report))
    }
}

/// Periodically push provider health and client counts to an observer.
pub fn spawn_health_refresh(
    state: Arc<HealthState>,
    observer: Arc<dyn PipelineObserver>,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let report = state.report();
                    observer.provider_health(&report.snapshot.circuit_breakers);
                    observer.clients_changed(report.connections, report.subscriptions);
                }
            }
        }
    })
}
