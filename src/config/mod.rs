//! Configuration Module - TOML-based Service Configuration
//!
//! Loads and validates configuration from `config.toml` (path overridable
//! with `MYTRADER_CONFIG`). Provider endpoints, symbols and resilience
//! parameters are externalized here - nothing is hardcoded in adapters.

pub mod loader;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::Deserialize;

use crate::domain::price::{AssetClass, SymbolAliases};

/// Top-level service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Service identity and logging.
  pub service: ServiceConfig,
  /// Client-facing hub server.
  #[serde(default)]
  pub server: ServerConfig,
  /// Metrics and health endpoints.
  #[serde(default)]
  pub metrics: MetricsConfig,
  /// Channel sizing and shutdown.
  #[serde(default)]
  pub pipeline: PipelineConfig,
  /// Upstream market data providers.
  pub providers: Vec<ProviderConfig>,
}

impl AppConfig {
  /// Look up a provider by name.
  pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
    self.providers.iter().find(|p| p.name == name)
  }
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Human-readable service name.
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
}

/// Client hub server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Bind address for the WebSocket hub.
  #[serde(default = "default_server_addr")]
  pub bind_address: String,
  /// Route the hub is mounted on.
  #[serde(default = "default_hub_path")]
  pub hub_path: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_address: default_server_addr(),
      hub_path: default_hub_path(),
    }
  }
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

/// Pipeline channel sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
  /// Capacity of each provider's tick channel.
  #[serde(default = "default_channel_capacity")]
  pub channel_capacity: usize,
  /// Capacity of each client's outbound queue.
  #[serde(default = "default_outbox_capacity")]
  pub client_outbox_capacity: usize,
  /// Upper bound on waiting for in-flight broadcasts at shutdown.
  #[serde(default = "default_shutdown_grace")]
  pub shutdown_grace_seconds: u64,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      channel_capacity: default_channel_capacity(),
      client_outbox_capacity: default_outbox_capacity(),
      shutdown_grace_seconds: default_shutdown_grace(),
    }
  }
}

/// Supported upstream adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
  /// Binance 24h ticker WebSocket stream.
  Binance,
  /// Yahoo Finance chart endpoint, polled.
  Yahoo,
}

/// Individual provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
  /// Unique provider name (used in logs, metrics, health).
  pub name: String,
  /// Adapter implementation.
  pub kind: ProviderKind,
  /// Asset class stamped on every tick from this provider.
  pub asset_class: AssetClass,
  /// Symbols to stream or poll.
  pub symbols: Vec<String>,
  /// Base URL override (WebSocket host for streaming, HTTP host for polling).
  pub url: Option<String>,
  /// Whether this provider runs at all.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Standby providers only run as another provider's fallback.
  #[serde(default)]
  pub standby: bool,
  /// Poll cadence (polling providers).
  #[serde(default = "default_update_interval")]
  pub update_interval_seconds: u64,
  /// Attempts per logical request, including the first.
  #[serde(default = "default_max_retry_attempts")]
  pub max_retry_attempts: u32,
  /// Bound on a single provider call.
  #[serde(default = "default_timeout")]
  pub timeout_seconds: u64,
  /// Consecutive failures that open the circuit.
  #[serde(default = "default_failure_threshold")]
  pub circuit_breaker_failure_threshold: u32,
  /// Initial Open -> HalfOpen cooldown.
  #[serde(default = "default_cooldown")]
  pub circuit_breaker_cooldown_seconds: u64,
  /// Cooldown growth after a failed HalfOpen trial.
  #[serde(default = "default_cooldown_multiplier")]
  pub cooldown_backoff_multiplier: f64,
  /// Cooldown ceiling.
  #[serde(default = "default_max_cooldown")]
  pub max_cooldown_seconds: u64,
  /// First retry delay; doubles per attempt.
  #[serde(default = "default_base_retry_delay")]
  pub base_retry_delay_ms: u64,
  /// Retry delay ceiling.
  #[serde(default = "default_max_retry_delay")]
  pub max_retry_delay_ms: u64,
  /// Minimum spacing between outbound requests (rate-limit floor).
  #[serde(default = "default_min_request_interval")]
  pub min_request_interval_ms: u64,
  /// Secondary provider used while this one's circuit is Open.
  pub fallback_provider: Option<String>,
  /// Upstream symbol -> published symbol, applied before normalization.
  #[serde(default)]
  pub symbol_aliases: BTreeMap<String, String>,
}

impl ProviderConfig {
  /// Poll interval as a `Duration`.
  pub const fn update_interval(&self) -> Duration {
    Duration::from_secs(self.update_interval_seconds)
  }

  /// Per-call timeout as a `Duration`.
  pub const fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_seconds)
  }

  /// Request floor as a `Duration`.
  pub const fn min_request_interval(&self) -> Duration {
    Duration::from_millis(self.min_request_interval_ms)
  }

  /// Alias table handed to the adapter.
  pub fn aliases(&self) -> SymbolAliases {
    SymbolAliases::new(&self.symbol_aliases)
  }

  /// Uppercase symbols this provider publishes once aliases are applied.
  pub fn published_symbols(&self) -> BTreeSet<String> {
    let aliases = self.aliases();
    self
      .symbols
      .iter()
      .map(|s| aliases.publish(s).trim().to_ascii_uppercase())
      .collect()
  }

  /// Whether a supervisor task should be spawned for this provider.
  pub const fn runs_standalone(&self) -> bool {
    self.enabled && !self.standby
  }
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

fn default_server_addr() -> String {
  "0.0.0.0:5002".to_string()
}

fn default_hub_path() -> String {
  "/hubs/marketdata".to_string()
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

fn default_health_port() -> u16 {
  8080
}

fn default_channel_capacity() -> usize {
  1024
}

fn default_outbox_capacity() -> usize {
  256
}

fn default_shutdown_grace() -> u64 {
  10
}

fn default_update_interval() -> u64 {
  60
}

fn default_max_retry_attempts() -> u32 {
  3
}

fn default_timeout() -> u64 {
  30
}

fn default_failure_threshold() -> u32 {
  5
}

fn default_cooldown() -> u64 {
  30
}

fn default_cooldown_multiplier() -> f64 {
  2.0
}

fn default_max_cooldown() -> u64 {
  300
}

fn default_base_retry_delay() -> u64 {
  500
}

fn default_max_retry_delay() -> u64 {
  10_000
}

fn default_min_request_interval() -> u64 {
  250
}
