//! Provider health model and service-level health aggregation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Circuit breaker state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Failing, calls are short-circuited until the cooldown elapses.
    Open,
    /// Cooldown elapsed, a single trial call is allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Read-only copy of one provider's health, as returned by the resilience
/// wrapper. Never a view into live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    pub provider: String,
    #[serde(rename = "state")]
    pub circuit_state: CircuitState,
    #[serde(rename = "failureCount")]
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set once the provider hit a non-retryable error (e.g. rejected credentials).
    pub fatal: bool,
}

impl ProviderHealth {
    /// A provider is failing while its last outcome was a failure.
    pub const fn is_failing(&self) -> bool {
        self.fatal || self.consecutive_failures > 0
    }
}

/// Per-provider call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatistics {
    /// Underlying calls actually attempted.
    pub attempts: u64,
    /// Attempts beyond the first within one logical request.
    pub retries: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls rejected without touching the provider.
    pub short_circuited: u64,
}

/// Service-level health reported on `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Aggregate provider health.
    ///
    /// - `Unhealthy`: some provider is failing and some circuit is Open
    /// - `Degraded`: exactly one of those holds
    /// - `Healthy`: neither holds
    pub fn aggregate<'a>(providers: impl IntoIterator<Item = &'a ProviderHealth>) -> Self {
        let mut any_failing = false;
        let mut any_open = false;

        for p in providers {
            any_failing |= p.is_failing();
            any_open |= p.circuit_state == CircuitState::Open;
        }

        match (any_failing, any_open) {
            (true, true) => Self::Unhealthy,
            (true, false) | (false, true) => Self::Degraded,
            (false, false) => Self::Healthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "Healthy"),
            Self::Degraded => write!(f, "Degraded"),
            Self::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}
