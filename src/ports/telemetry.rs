//! Telemetry Port - Pipeline Observation Hooks
//!
//! Lets the usecases layer report what it does without depending on a
//! metrics backend. The Prometheus adapter implements this trait; tests
//! and tools use `NoopObserver`.

use std::time::Duration;

use crate::domain::health::ProviderHealth;
use crate::domain::price::AssetClass;

/// Receives pipeline events. Every method defaults to a no-op.
pub trait PipelineObserver: Send + Sync + 'static {
    /// A raw tick arrived from a provider.
    fn tick_received(&self, _provider: &str) {}

    /// A tick was discarded before broadcast.
    fn tick_dropped(&self, _provider: &str, _reason: &str) {}

    /// One fan-out pass finished.
    fn fanout_completed(&self, _asset_class: AssetClass, _delivered: usize, _failed: usize) {}

    /// One resilience-wrapped provider call finished.
    fn provider_call(&self, _provider: &str, _elapsed: Duration, _ok: bool) {}

    /// Fresh copy of provider health.
    fn provider_health(&self, _health: &[ProviderHealth]) {}

    /// Connection or subscription counts changed.
    fn clients_changed(&self, _connections: usize, _subscriptions: usize) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}
