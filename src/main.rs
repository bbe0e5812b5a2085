//! myTrader Price Feed - Entry Point
//!
//! Initializes configuration and logging, wires providers through the
//! resilience layer into per-provider dispatch tasks, and serves clients
//! over the WebSocket hub. Runs until SIGINT.
//!
//! Wiring sequence:
//! 1. Load config.toml (or $MYTRADER_CONFIG) + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Create metrics registry, subscription registry, broadcaster
//! 4. Create resilience wrapper with one circuit per provider
//! 5. Build provider adapters (Binance stream, Yahoo poller)
//! 6. Spawn one dispatch task + one supervisor per runnable provider
//! 7. Spawn hub (:5002), health (:8080) and metrics (:9090) servers
//! 8. Wait for SIGINT → graceful shutdown (stop feeds→drain→stop servers)

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use mytrader_pricefeed::adapters::feeds::{ProviderSupervisor, build_provider};
use mytrader_pricefeed::adapters::gateway::{HubServer, HubState};
use mytrader_pricefeed::adapters::metrics::{
    HealthServer, HealthState, MetricsRegistry, spawn_health_refresh,
};
use mytrader_pricefeed::config;
use mytrader_pricefeed::ports::price_provider::PriceProvider;
use mytrader_pricefeed::ports::telemetry::{NoopObserver, PipelineObserver};
use mytrader_pricefeed::usecases::{
    Broadcaster, DispatchStats, Pipeline, ResilienceWrapper, SubscriptionRegistry,
};

/// How often provider health is pushed into the metrics gauges.
const HEALTH_REFRESH: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration ───────────────────────────────
    let config_path = config::loader::config_path();
    let config = config::loader::load_config(&config_path)
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level)),
        )
        .json()
        .init();

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        providers = config.providers.len(),
        "Starting myTrader price feed"
    );

    // ── 3. Shutdown signal channels ─────────────────────────
    // Phase one stops the feeds; phase two stops the servers once the
    // pipeline has drained.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (stop_servers_tx, _) = broadcast::channel::<()>(1);

    // ── 4. Core pipeline components ─────────────────────────
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to create metrics registry")?);
    let observer: Arc<dyn PipelineObserver> = if config.metrics.enabled {
        Arc::clone(&metrics) as Arc<dyn PipelineObserver>
    } else {
        Arc::new(NoopObserver)
    };

    let registry = Arc::new(SubscriptionRegistry::new());
    let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry), Arc::clone(&observer)));
    let pipeline = Pipeline::new(
        broadcaster,
        Arc::clone(&observer),
        config.pipeline.channel_capacity,
    );

    let enabled: Vec<&config::ProviderConfig> =
        config.providers.iter().filter(|p| p.enabled).collect();
    let resilience = Arc::new(ResilienceWrapper::from_configs(enabled.iter().copied()));

    // ── 5. Provider adapters ────────────────────────────────
    let mut providers: HashMap<String, Arc<dyn PriceProvider>> = HashMap::new();
    for provider_config in &enabled {
        let provider = build_provider(provider_config)?;
        providers.insert(provider_config.name.clone(), provider);
    }

    // ── 6. Dispatch tasks + supervisors ─────────────────────
    let mut dispatch_handles: Vec<(String, JoinHandle<DispatchStats>)> = Vec::new();
    let mut supervisor_handles: Vec<JoinHandle<()>> = Vec::new();

    for provider_config in enabled.iter().filter(|p| p.runs_standalone()) {
        let Some(primary) = providers.get(&provider_config.name) else {
            continue;
        };

        let (events, dispatch) = pipeline.spawn_channel(&provider_config.name);
        dispatch_handles.push((provider_config.name.clone(), dispatch));

        let mut supervisor = ProviderSupervisor::new(
            Arc::clone(primary),
            Arc::clone(&resilience),
            Arc::clone(&observer),
            events,
        );
        if let Some(fallback_name) = &provider_config.fallback_provider {
            match providers.get(fallback_name) {
                Some(fallback) => supervisor = supervisor.with_fallback(Arc::clone(fallback)),
                None => warn!(
                    provider = %provider_config.name,
                    fallback = %fallback_name,
                    "Fallback provider not available, running without it"
                ),
            }
        }

        supervisor_handles.push(supervisor.spawn(shutdown_tx.subscribe()));
    }

    info!(supervisors = supervisor_handles.len(), "Provider supervisors spawned");

    // ── 7. Servers ──────────────────────────────────────────
    let health_state = Arc::new(HealthState::new(Arc::clone(&resilience), Arc::clone(&registry)));

    let mut server_handles: Vec<JoinHandle<()>> = Vec::new();

    let health_server = HealthServer::new(Arc::clone(&health_state), config.metrics.health_port);
    let health_rx = stop_servers_tx.subscribe();
    server_handles.push(tokio::spawn(async move {
        if let Err(e) = health_server.run(health_rx).await {
            error!(error = %e, "Health server failed");
        }
    }));

    server_handles.push(spawn_health_refresh(
        Arc::clone(&health_state),
        Arc::clone(&observer),
        HEALTH_REFRESH,
        stop_servers_tx.subscribe(),
    ));

    if config.metrics.enabled {
        let metrics_addr = config.metrics.bind_address.clone();
        let metrics_rx = stop_servers_tx.subscribe();
        let metrics_ref = Arc::clone(&metrics);
        server_handles.push(tokio::spawn(async move {
            if let Err(e) = metrics_ref.serve(metrics_addr, metrics_rx).await {
                error!(error = %e, "Metrics server failed");
            }
        }));
    }

    let hub_state = Arc::new(HubState::new(
        Arc::clone(&registry),
        Arc::clone(&observer),
        config.pipeline.client_outbox_capacity,
        stop_servers_tx.clone(),
    ));
    let hub = HubServer::new(hub_state, config.server.bind_address.clone(), config.server.hub_path.clone());
    server_handles.push(tokio::spawn(async move {
        if let Err(e) = hub.run().await {
            error!(error = %e, "Market data hub failed");
        }
    }));

    info!("All tasks spawned - price feed is running");

    // ── 8. Wait for SIGINT ──────────────────────────────────
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for SIGINT, shutting down");
    } else {
        info!("SIGINT received, initiating graceful shutdown");
    }

    let grace = Duration::from_secs(config.pipeline.shutdown_grace_seconds);

    // 1. Stop feeds and flip readiness
    let _ = shutdown_tx.send(());
    health_state.begin_shutdown();
    info!("Shutdown signal broadcast to provider supervisors");

    // 2. Supervisors exit and drop their channel senders
    for handle in supervisor_handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!("Provider supervisor did not stop within grace period");
        }
    }

    // 3. Dispatch tasks drain what is queued
    for (provider, handle) in dispatch_handles {
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(stats)) => info!(
                provider = %provider,
                events = stats.events,
                delivered = stats.delivered,
                failed = stats.failed,
                "Provider pipeline drained"
            ),
            Ok(Err(e)) => error!(provider = %provider, error = %e, "Dispatch task panicked"),
            Err(_) => warn!(provider = %provider, "Dispatch task did not drain within grace period"),
        }
    }

    // 4. Stop servers; hub connections flush and close
    let _ = stop_servers_tx.send(());
    for handle in server_handles {
        let _ = tokio::time::timeout(grace, handle).await;
    }

    info!("Shutdown complete");
    Ok(())
}
