//! Prometheus Metrics Registry - Pipeline Observability
//!
//! Registers and exposes Prometheus metrics on :9090 for Grafana
//! dashboards. Covers tick intake, fan-out deliveries, client counts,
//! provider call latency and circuit state. Implements
//! `PipelineObserver` so the usecases layer can feed it directly.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{error, info, instrument};

use crate::domain::health::{CircuitState, ProviderHealth};
use crate::domain::price::AssetClass;
use crate::ports::telemetry::PipelineObserver;

/// Centralized Prometheus metrics for the price pipeline.
///
/// All metrics follow the naming convention `mytrader_pricefeed_*`.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,
    /// Raw ticks received per provider.
    pub ticks_received: IntCounterVec,
    /// Ticks dropped before broadcast, by reason.
    pub ticks_dropped: IntCounterVec,
    /// Fan-out passes per asset class.
    pub updates_broadcast: IntCounterVec,
    /// Individual client deliveries, by outcome.
    pub deliveries: IntCounterVec,
    /// Open client connections.
    pub active_connections: IntGauge,
    /// Interests held across all connections.
    pub active_subscriptions: IntGauge,
    /// Circuit state per provider (0 = Closed, 1 = HalfOpen, 2 = Open).
    pub circuit_state: IntGaugeVec,
    /// Consecutive failures per provider.
    pub consecutive_failures: IntGaugeVec,
    /// Resilience-wrapped provider call latency (seconds).
    pub provider_call_seconds: HistogramVec,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let ticks_received = IntCounterVec::new(
            Opts::new("mytrader_pricefeed_ticks_received_total", "Raw ticks received from providers"),
            &["provider"],
        )?;

        let ticks_dropped = IntCounterVec::new(
            Opts::new(
                "mytrader_pricefeed_ticks_dropped_total",
                "Ticks discarded before broadcast",
            ),
            &["provider", "reason"],
        )?;

        let updates_broadcast = IntCounterVec::new(
            Opts::new(
                "mytrader_pricefeed_updates_broadcast_total",
                "Fan-out passes completed",
            ),
            &["asset_class"],
        )?;

        let deliveries = IntCounterVec::new(
            Opts::new("mytrader_pricefeed_deliveries_total", "Frames pushed to clients"),
            &["asset_class", "outcome"],
        )?;

        let active_connections = IntGauge::new(
            "mytrader_pricefeed_active_connections",
            "Open client connections",
        )?;

        let active_subscriptions = IntGauge::new(
            "mytrader_pricefeed_active_subscriptions",
            "Subscription interests held by clients",
        )?;

        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "mytrader_pricefeed_circuit_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
            ),
            &["provider"],
        )?;

        let consecutive_failures = IntGaugeVec::new(
            Opts::new(
                "mytrader_pricefeed_provider_consecutive_failures",
                "Consecutive failed calls per provider",
            ),
            &["provider"],
        )?;

        let provider_call_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mytrader_pricefeed_provider_call_seconds",
                "Resilience-wrapped provider call latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["provider", "outcome"],
        )?;

        // Register all metrics
        registry.register(Box::new(ticks_received.clone()))?;
        registry.register(Box::new(ticks_dropped.clone()))?;
        registry.register(Box::new(updates_broadcast.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(active_subscriptions.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(consecutive_failures.clone()))?;
        registry.register(Box::new(provider_call_seconds.clone()))?;

        Ok(Self {
            registry,
            ticks_received,
            ticks_dropped,
            updates_broadcast,
            deliveries,
            active_connections,
            active_subscriptions,
            circuit_state,
            consecutive_failures,
            provider_call_seconds,
        })
    }

    /// Encode every registered metric in the text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                async move {
                    match metrics.render() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => {
                            error!(error = %e, "Failed to encode metrics");
                            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
                        }
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}

const fn circuit_code(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

fn gauge_value(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl PipelineObserver for MetricsRegistry {
    fn tick_received(&self, provider: &str) {
        self.ticks_received.with_label_values(&[provider]).inc();
    }

    fn tick_dropped(&self, provider: &str, reason: &str) {
        self.ticks_dropped.with_label_values(&[provider, reason]).inc();
    }

    fn fanout_completed(&self, asset_class: AssetClass, delivered: usize, failed: usize) {
        let class = asset_class.as_str();
        self.updates_broadcast.with_label_values(&[class]).inc();
        self.deliveries
            .with_label_values(&[class, "ok"])
            .inc_by(delivered as u64);
        self.deliveries
            .with_label_values(&[class, "failed"])
            .inc_by(failed as u64);
    }

    fn provider_call(&self, provider: &str, elapsed: Duration, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.provider_call_seconds
            .with_label_values(&[provider, outcome])
            .observe(elapsed.as_secs_f64());
    }

    fn provider_health(&self, health: &[ProviderHealth]) {
        for provider in health {
            self.circuit_state
                .with_label_values(&[provider.provider.as_str()])
                .set(circuit_code(provider.circuit_state));
            self.consecutive_failures
                .with_label_values(&[provider.provider.as_str()])
                .set(i64::from(provider.consecutive_failures));
        }
    }

    fn clients_changed(&self, connections: usize, subscriptions: usize) {
        self.active_connections.set(gauge_value(connections));
        self.active_subscriptions.set(gauge_value(subscriptions));
    }
}
