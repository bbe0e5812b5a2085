//! Resilience Wrapper - Retry Budget and Per-Provider Circuit Breakers
//!
//! Every provider call goes through `ResilienceWrapper::execute`, which
//! applies, in order:
//! - circuit admission (fail fast while Open, single trial while HalfOpen)
//! - a per-attempt timeout
//! - exponential backoff between attempts, never while the circuit is Open
//!
//! State machine per provider:
//!
//! ```text
//! Closed --threshold failures--> Open --cooldown elapsed--> HalfOpen
//!   ^                              ^                           |
//!   +-------- trial succeeds ------+---- trial fails ----------+
//! ```
//!
//! A failed trial re-opens the circuit with a longer cooldown (capped).
//! Per-provider state lives behind its own mutex, never held across an
//! `.await`; the provider map itself is fixed at construction.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::domain::health::{CircuitState, HealthStatus, ProviderHealth, RetryStatistics};
use crate::ports::price_provider::ProviderError;

/// Resilience parameters for one provider.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    /// Attempts per logical request, including the first.
    pub max_retry_attempts: u32,
    /// Bound on each attempt.
    pub timeout: Duration,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Initial Open -> HalfOpen cooldown.
    pub cooldown: Duration,
    /// Cooldown growth factor after a failed trial.
    pub cooldown_multiplier: f64,
    /// Cooldown ceiling.
    pub max_cooldown: Duration,
    /// First retry delay.
    pub base_retry_delay: Duration,
    /// Retry delay ceiling.
    pub max_retry_delay: Duration,
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            timeout: Duration::from_secs(30),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
            base_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
        }
    }
}

impl From<&ProviderConfig> for ResiliencePolicy {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts.max(1),
            timeout: config.timeout(),
            failure_threshold: config.circuit_breaker_failure_threshold.max(1),
            cooldown: Duration::from_secs(config.circuit_breaker_cooldown_seconds),
            cooldown_multiplier: config.cooldown_backoff_multiplier.max(1.0),
            max_cooldown: Duration::from_secs(config.max_cooldown_seconds),
            base_retry_delay: Duration::from_millis(config.base_retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }
}

impl ResiliencePolicy {
    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_retry_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_retry_delay)
    }

    /// Worst-case wall time of one `execute` call.
    pub fn worst_case(&self) -> Duration {
        let backoff_total: Duration = (1..self.max_retry_attempts).map(|r| self.backoff(r)).sum();
        self.timeout.saturating_mul(self.max_retry_attempts) + backoff_total
    }

    fn grow_cooldown(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.cooldown_multiplier)
            .map_or(self.max_cooldown, |grown| grown.min(self.max_cooldown))
    }
}

/// Why `execute` did not return a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    /// Short-circuited: no provider call was made.
    #[error("circuit open for {provider}, next trial in {retry_after:?}")]
    CircuitOpen {
        provider: String,
        retry_after: Duration,
    },
    /// Every attempt failed with a retryable error.
    #[error("{provider} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        provider: String,
        attempts: u32,
        last: ProviderError,
    },
    /// Non-retryable failure; escalate.
    #[error("fatal error from {provider}: {error}")]
    Fatal {
        provider: String,
        error: ProviderError,
    },
    /// The provider was never registered with the wrapper.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

/// Live circuit state for one provider.
#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    fatal: bool,
    stats: RetryStatistics,
}

enum Admission {
    Allowed { trial: bool },
    Rejected { retry_after: Duration },
}

/// Policy plus guarded state for one provider.
struct ProviderGuard {
    name: String,
    policy: ResiliencePolicy,
    breaker: Mutex<Breaker>,
}

impl ProviderGuard {
    fn new(name: String, policy: ResiliencePolicy) -> Self {
        let breaker = Breaker {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown: policy.cooldown,
            trial_in_flight: false,
            last_success_at: None,
            last_error: None,
            fatal: false,
            stats: RetryStatistics::default(),
        };
        Self {
            name,
            policy,
            breaker: Mutex::new(breaker),
        }
    }

    /// Lock the breaker, recovering from poison: stale circuit state is
    /// better than a panicking feed.
    fn lock(&self) -> MutexGuard<'_, Breaker> {
        self.breaker.lock().unwrap_or_else(|poisoned| {
            warn!(provider = %self.name, "Circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn admit(&self, is_retry: bool) -> Admission {
        let mut b = self.lock();

        let admission = match b.state {
            CircuitState::Closed => Admission::Allowed { trial: false },
            CircuitState::Open => {
                let elapsed = b.opened_at.map_or(b.cooldown, |t| t.elapsed());
                if elapsed >= b.cooldown {
                    info!(provider = %self.name, "Circuit breaker Open -> HalfOpen");
                    b.state = CircuitState::HalfOpen;
                    b.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                } else {
                    Admission::Rejected {
                        retry_after: b.cooldown - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if b.trial_in_flight {
                    Admission::Rejected {
                        retry_after: self.policy.base_retry_delay,
                    }
                } else {
                    b.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                }
            }
        };

        match admission {
            Admission::Allowed { .. } => {
                b.stats.attempts += 1;
                if is_retry {
                    b.stats.retries += 1;
                }
            }
            Admission::Rejected { .. } => b.stats.short_circuited += 1,
        }
        admission
    }

    fn on_success(&self) {
        let mut b = self.lock();
        if b.state != CircuitState::Closed {
            info!(provider = %self.name, from = %b.state, "Circuit breaker closing after successful trial");
        }
        b.state = CircuitState::Closed;
        b.consecutive_failures = 0;
        b.opened_at = None;
        b.cooldown = self.policy.cooldown;
        b.trial_in_flight = false;
        b.last_success_at = Some(Utc::now());
        b.last_error = None;
        b.fatal = false;
        b.stats.successes += 1;
    }

    fn on_failure(&self, error: &ProviderError) {
        let mut b = self.lock();
        b.consecutive_failures = b.consecutive_failures.saturating_add(1);
        b.last_error = Some(error.to_string());
        b.stats.failures += 1;
        if error.is_fatal() {
            b.fatal = true;
        }

        match b.state {
            CircuitState::Closed => {
                if b.consecutive_failures >= self.policy.failure_threshold {
                    warn!(
                        provider = %self.name,
                        failures = b.consecutive_failures,
                        cooldown_ms = b.cooldown.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                    b.state = CircuitState::Open;
                    b.opened_at = Some(Instant::now());
                } else {
                    debug!(
                        provider = %self.name,
                        failures = b.consecutive_failures,
                        threshold = self.policy.failure_threshold,
                        "Provider call failed"
                    );
                }
            }
            CircuitState::HalfOpen => {
                let cooldown = self.policy.grow_cooldown(b.cooldown);
                warn!(
                    provider = %self.name,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Trial call failed, circuit re-opened"
                );
                b.state = CircuitState::Open;
                b.opened_at = Some(Instant::now());
                b.cooldown = cooldown;
                b.trial_in_flight = false;
            }
            CircuitState::Open => {
                debug!(provider = %self.name, "Additional failure while circuit open");
            }
        }
    }

    /// Release a trial slot whose call never completed (caller dropped).
    fn abandon_trial(&self) {
        let mut b = self.lock();
        if b.state == CircuitState::HalfOpen {
            b.trial_in_flight = false;
        }
    }

    fn remaining_cooldown(&self) -> Option<Duration> {
        let b = self.lock();
        match (b.state, b.opened_at) {
            (CircuitState::Open, Some(at)) => Some(b.cooldown.saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    fn health(&self) -> (ProviderHealth, RetryStatistics) {
        let b = self.lock();
        let health = ProviderHealth {
            provider: self.name.clone(),
            circuit_state: b.state,
            consecutive_failures: b.consecutive_failures,
            last_success_at: b.last_success_at,
            last_error: b.last_error.clone(),
            fatal: b.fatal,
        };
        (health, b.stats)
    }
}

/// Releases the HalfOpen trial slot if the trial future is dropped before
/// it reports an outcome.
struct TrialSlot<'a> {
    guard: &'a ProviderGuard,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.guard.abandon_trial();
        }
    }
}

/// Retry statistics tagged with their provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRetryStatistics {
    pub provider: String,
    #[serde(flatten)]
    pub stats: RetryStatistics,
}

/// Point-in-time copy of every provider's circuit and counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub circuit_breakers: Vec<ProviderHealth>,
    pub retry_statistics: Vec<ProviderRetryStatistics>,
}

impl HealthSnapshot {
    /// Aggregate service health.
    pub fn status(&self) -> HealthStatus {
        HealthStatus::aggregate(&self.circuit_breakers)
    }

    /// Health of one provider, if registered.
    pub fn provider(&self, name: &str) -> Option<&ProviderHealth> {
        self.circuit_breakers.iter().find(|p| p.provider == name)
    }
}

/// Shields the pipeline from transient provider failures.
///
/// Owned by the process and shared by `Arc`; the only component allowed to
/// mutate provider health.
pub struct ResilienceWrapper {
    providers: HashMap<String, ProviderGuard>,
}

impl ResilienceWrapper {
    /// Register every provider up front; the set is fixed afterwards.
    pub fn new(providers: impl IntoIterator<Item = (String, ResiliencePolicy)>) -> Self {
        let providers = providers
            .into_iter()
            .map(|(name, policy)| (name.clone(), ProviderGuard::new(name, policy)))
            .collect();
        Self { providers }
    }

    /// Build from every configured provider.
    pub fn from_configs<'a>(configs: impl IntoIterator<Item = &'a ProviderConfig>) -> Self {
        Self::new(
            configs
                .into_iter()
                .map(|c| (c.name.clone(), ResiliencePolicy::from(c))),
        )
    }

    fn guard(&self, provider: &str) -> Result<&ProviderGuard, ResilienceError> {
        self.providers
            .get(provider)
            .ok_or_else(|| ResilienceError::UnknownProvider(provider.to_string()))
    }

    /// Run one logical provider request under retry + circuit policy.
    ///
    /// Returns within `policy.worst_case()`; never sleeps while holding
    /// provider state.
    pub async fn execute<T, F, Fut>(&self, provider: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run(provider, op, true).await
    }

    /// Like `execute`, but an `Ok` only means the session was opened.
    ///
    /// The outcome is left pending: the caller settles it later with
    /// `report_success` (first tick) or `report_failure` (disconnect), so a
    /// stream that connects and drops before delivering anything keeps
    /// counting towards the failure threshold. A HalfOpen trial stays in
    /// flight until then, or until `release_trial`.
    pub async fn execute_deferred<T, F, Fut>(&self, provider: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.run(provider, op, false).await
    }

    async fn run<T, F, Fut>(&self, provider: &str, mut op: F, settle: bool) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let guard = self.guard(provider)?;
        let policy = &guard.policy;
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=policy.max_retry_attempts {
            if attempt > 1 {
                let delay = policy.backoff(attempt - 1);
                debug!(
                    provider,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying provider call"
                );
                sleep(delay).await;
            }

            let trial = match guard.admit(attempt > 1) {
                Admission::Allowed { trial } => trial,
                Admission::Rejected { retry_after } => {
                    return Err(ResilienceError::CircuitOpen {
                        provider: provider.to_string(),
                        retry_after,
                    });
                }
            };
            let mut slot = TrialSlot {
                guard,
                armed: trial,
            };

            let outcome = match timeout(policy.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(policy.timeout)),
            };
            slot.armed = false;

            match outcome {
                Ok(value) => {
                    if settle {
                        guard.on_success();
                    }
                    return Ok(value);
                }
                Err(error) => {
                    guard.on_failure(&error);
                    if error.is_fatal() {
                        return Err(ResilienceError::Fatal {
                            provider: provider.to_string(),
                            error,
                        });
                    }
                    warn!(provider, attempt, error = %error, "Provider call failed");
                    last_error = Some(error);
                }
            }
        }

        Err(ResilienceError::Exhausted {
            provider: provider.to_string(),
            attempts: policy.max_retry_attempts,
            last: last_error.unwrap_or(ProviderError::Transport("no attempt made".to_string())),
        })
    }

    /// Feed a failure observed outside `execute` (e.g. a live stream
    /// dropping) into the provider's state machine.
    pub fn report_failure(&self, provider: &str, error: &ProviderError) {
        match self.guard(provider) {
            Ok(guard) => guard.on_failure(error),
            Err(e) => warn!(error = %e, "Failure reported for unregistered provider"),
        }
    }

    /// Feed a success observed outside `execute`.
    pub fn report_success(&self, provider: &str) {
        match self.guard(provider) {
            Ok(guard) => guard.on_success(),
            Err(e) => warn!(error = %e, "Success reported for unregistered provider"),
        }
    }

    /// Give back a HalfOpen trial slot held by a deferred session that
    /// ended without an outcome.
    pub fn release_trial(&self, provider: &str) {
        if let Ok(guard) = self.guard(provider) {
            guard.abandon_trial();
        }
    }

    /// Remaining cooldown while the provider's circuit is Open.
    pub fn open_for(&self, provider: &str) -> Option<Duration> {
        self.guard(provider).ok().and_then(ProviderGuard::remaining_cooldown)
    }

    /// Current circuit state of one provider.
    pub fn state(&self, provider: &str) -> Option<CircuitState> {
        self.guard(provider).ok().map(|g| g.lock().state)
    }

    /// Resilience policy of one provider.
    pub fn policy(&self, provider: &str) -> Option<&ResiliencePolicy> {
        self.guard(provider).ok().map(|g| &g.policy)
    }

    /// Read-only copy of every provider's health, sorted by name.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let mut entries: Vec<_> = self.providers.values().map(ProviderGuard::health).collect();
        entries.sort_by(|a, b| a.0.provider.cmp(&b.0.provider));

        let (circuit_breakers, retry_statistics) = entries
            .into_iter()
            .map(|(health, stats)| {
                let tagged = ProviderRetryStatistics {
                    provider: health.provider.clone(),
                    stats,
                };
                (health, tagged)
            })
            .unzip();

        HealthSnapshot {
            timestamp: Utc::now(),
            circuit_breakers,
            retry_statistics,
        }
    }
}
