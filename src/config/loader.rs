//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::AppConfig;

/// Environment variable overriding the config file path.
pub const CONFIG_PATH_ENV: &str = "MYTRADER_CONFIG";

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Upper bound on cooldown growth per failed trial.
pub const MAX_COOLDOWN_MULTIPLIER: f64 = 100.0;

/// Resolve the config path from the environment, falling back to `config.toml`.
pub fn config_path() -> String {
  std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)?;

  info!(
    providers = config.providers.len(),
    hub = %config.server.bind_address,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig =
    toml::from_str(content).with_context(|| "Failed to parse config.toml")?;

  validate_config(&config)?;
  Ok(config)
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - At least one runnable provider, unique names
/// - Non-empty symbol lists
/// - Positive timeouts, retry budgets and thresholds
/// - Fallback references that resolve to another configured provider
///   publishing the same asset class and symbols
fn validate_config(config: &AppConfig) -> Result<()> {
  anyhow::ensure!(
    config.providers.iter().any(|p| p.runs_standalone()),
    "At least one enabled, non-standby provider must be configured"
  );

  let mut names = HashSet::new();
  for (i, provider) in config.providers.iter().enumerate() {
    anyhow::ensure!(
      !provider.name.trim().is_empty(),
      "Provider {} has an empty name",
      i
    );
    anyhow::ensure!(
      names.insert(provider.name.as_str()),
      "Provider name '{}' is configured twice",
      provider.name
    );
    anyhow::ensure!(
      !provider.symbols.is_empty(),
      "Provider '{}' has no symbols",
      provider.name
    );
    anyhow::ensure!(
      provider.symbols.iter().all(|s| !s.trim().is_empty()),
      "Provider '{}' has an empty symbol",
      provider.name
    );
    anyhow::ensure!(
      provider.max_retry_attempts >= 1,
      "Provider '{}': max_retry_attempts must be at least 1",
      provider.name
    );
    anyhow::ensure!(
      provider.timeout_seconds > 0,
      "Provider '{}': timeout_seconds must be positive",
      provider.name
    );
    anyhow::ensure!(
      provider.circuit_breaker_failure_threshold > 0,
      "Provider '{}': circuit_breaker_failure_threshold must be positive",
      provider.name
    );
    anyhow::ensure!(
      provider.update_interval_seconds > 0,
      "Provider '{}': update_interval_seconds must be positive",
      provider.name
    );
    anyhow::ensure!(
      provider.cooldown_backoff_multiplier.is_finite()
        && (1.0..=MAX_COOLDOWN_MULTIPLIER).contains(&provider.cooldown_backoff_multiplier),
      "Provider '{}': cooldown_backoff_multiplier must be between 1.0 and {}, got {}",
      provider.name,
      MAX_COOLDOWN_MULTIPLIER,
      provider.cooldown_backoff_multiplier
    );
    for upstream in provider.symbol_aliases.keys() {
      anyhow::ensure!(
        provider
          .symbols
          .iter()
          .any(|s| s.trim().eq_ignore_ascii_case(upstream.trim())),
        "Provider '{}': alias for unconfigured symbol '{}'",
        provider.name,
        upstream
      );
    }
    anyhow::ensure!(
      provider.max_cooldown_seconds >= provider.circuit_breaker_cooldown_seconds,
      "Provider '{}': max_cooldown_seconds must be >= circuit_breaker_cooldown_seconds",
      provider.name
    );
  }

  for provider in &config.providers {
    if let Some(fallback) = &provider.fallback_provider {
      anyhow::ensure!(
        fallback != &provider.name,
        "Provider '{}' lists itself as fallback",
        provider.name
      );
      let target = config.provider(fallback).with_context(|| {
        format!(
          "Provider '{}' names unknown fallback '{}'",
          provider.name, fallback
        )
      })?;
      anyhow::ensure!(
        target.enabled,
        "Fallback provider '{}' is disabled",
        fallback
      );
      anyhow::ensure!(
        target.asset_class == provider.asset_class,
        "Fallback provider '{}' publishes {} but '{}' publishes {}",
        fallback,
        target.asset_class,
        provider.name,
        provider.asset_class
      );
      let covered = target.published_symbols();
      let missing: Vec<String> = provider
        .published_symbols()
        .into_iter()
        .filter(|s| !covered.contains(s))
        .collect();
      anyhow::ensure!(
        missing.is_empty(),
        "Fallback provider '{}' does not publish {:?} for '{}'; add symbol_aliases",
        fallback,
        missing,
        provider.name
      );
    }
  }

  anyhow::ensure!(
    config.pipeline.channel_capacity > 0 && config.pipeline.client_outbox_capacity > 0,
    "Pipeline channel capacities must be positive"
  );
  anyhow::ensure!(
    config.server.hub_path.starts_with('/'),
    "Hub path must start with '/', got {}",
    config.server.hub_path
  );

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::ProviderKind;
  use crate::domain::price::AssetClass;
  use tokio_test::{assert_err, assert_ok};

  const SAMPLE: &str = r#"
[service]
name = "pricefeed-test"

[[providers]]
name = "binance"
kind = "binance"
asset_class = "CRYPTO"
symbols = ["BTCUSDT", "ETHUSDT"]
fallback_provider = "yahoo-crypto"

[[providers]]
name = "yahoo-stocks"
kind = "yahoo"
asset_class = "STOCK"
symbols = ["AAPL", "MSFT"]
update_interval_seconds = 15
min_request_interval_ms = 500

[[providers]]
name = "yahoo-crypto"
kind = "yahoo"
asset_class = "CRYPTO"
symbols = ["BTC-USD", "ETH-USD"]
symbol_aliases = { "BTC-USD" = "BTCUSDT", "ETH-USD" = "ETHUSDT" }
standby = true
"#;

  #[test]
  fn test_load_nonexistent_file() {
    assert_err!(load_config("nonexistent.toml"));
  }

  #[test]
  fn test_parse_sample_with_defaults() {
    let config = assert_ok!(parse_config(SAMPLE));

    assert_eq!(config.providers.len(), 3);
    assert_eq!(config.server.hub_path, "/hubs/marketdata");
    assert_eq!(config.service.log_level, "info");

    let binance = config.provider("binance").unwrap();
    assert_eq!(binance.kind, ProviderKind::Binance);
    assert_eq!(binance.asset_class, AssetClass::Crypto);
    assert_eq!(binance.max_retry_attempts, 3);
    assert_eq!(binance.circuit_breaker_failure_threshold, 5);
    assert_eq!(binance.fallback_provider.as_deref(), Some("yahoo-crypto"));

    let stocks = config.provider("yahoo-stocks").unwrap();
    assert_eq!(stocks.update_interval_seconds, 15);
    assert_eq!(stocks.min_request_interval_ms, 500);

    let standby = config.provider("yahoo-crypto").unwrap();
    assert!(!standby.runs_standalone());
    assert_eq!(standby.aliases().publish("btc-usd"), "BTCUSDT");
    assert_eq!(standby.published_symbols(), binance.published_symbols());
  }

  #[test]
  fn test_unknown_fallback_rejected() {
    let broken = SAMPLE.replace("fallback_provider = \"yahoo-crypto\"", "fallback_provider = \"nope\"");
    let err = parse_config(&broken).unwrap_err();
    assert!(format!("{err:#}").contains("unknown fallback"));
  }

  #[test]
  fn test_duplicate_provider_names_rejected() {
    let dup = SAMPLE.replace("name = \"yahoo-stocks\"", "name = \"binance\"");
    assert_err!(parse_config(&dup));
  }

  #[test]
  fn test_zero_retry_attempts_rejected() {
    let bad = SAMPLE.replace("update_interval_seconds = 15", "update_interval_seconds = 15\nmax_retry_attempts = 0");
    assert_err!(parse_config(&bad));
  }

  #[test]
  fn test_fallback_must_cover_primary_symbols() {
    let unaliased = SAMPLE.replace(
      "symbol_aliases = { \"BTC-USD\" = \"BTCUSDT\", \"ETH-USD\" = \"ETHUSDT\" }\n",
      "",
    );
    let err = parse_config(&unaliased).unwrap_err();
    assert!(format!("{err:#}").contains("does not publish"));

    let partial = SAMPLE.replace(", \"ETH-USD\" = \"ETHUSDT\"", "");
    assert_err!(parse_config(&partial));
  }

  #[test]
  fn test_alias_for_unknown_symbol_rejected() {
    let bad = SAMPLE.replace("\"ETH-USD\" = \"ETHUSDT\"", "\"ETH-USD\" = \"ETHUSDT\", \"XRP-USD\" = \"XRPUSDT\"");
    let err = parse_config(&bad).unwrap_err();
    assert!(format!("{err:#}").contains("unconfigured symbol"));
  }

  #[test]
  fn test_cooldown_multiplier_bounds() {
    for bad in ["inf", "nan", "0.5", "1e300"] {
      let config = SAMPLE.replace(
        "update_interval_seconds = 15",
        &format!("update_interval_seconds = 15\ncooldown_backoff_multiplier = {bad}"),
      );
      assert_err!(parse_config(&config), "multiplier {} accepted", bad);
    }
    let ok = SAMPLE.replace(
      "update_interval_seconds = 15",
      "update_interval_seconds = 15\ncooldown_backoff_multiplier = 3.0",
    );
    assert_ok!(parse_config(&ok));
  }
}
