//! Price Provider Port - Upstream Market Data Interface
//!
//! Defines the trait every upstream adapter implements. The supervisor and
//! the rest of the pipeline only ever see `dyn PriceProvider`, never a
//! concrete exchange type.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::domain::price::PriceTick;

/// Typed failure reported by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Network-level failure (connect refused, TLS, DNS, reset).
    #[error("transport error: {0}")]
    Transport(String),
    /// The call did not complete within the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// An established stream dropped.
    #[error("disconnected: {0}")]
    Disconnected(String),
    /// Upstream asked us to slow down.
    #[error("rate limited by upstream")]
    RateLimited,
    /// Upstream answered with a server-side error.
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },
    /// Response could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Credentials or access rejected. Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl ProviderError {
    /// Whether the resilience layer may retry after this error.
    pub const fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// Fatal errors escalate immediately and stop the provider.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// How a provider produces data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// One long-lived push connection.
    Streaming,
    /// One request batch per interval.
    Polling(Duration),
}

/// Result of one successful `open()` call.
pub enum TickSession {
    /// A batch of ticks from a single poll.
    Snapshot(Vec<PriceTick>),
    /// A live connection. Yields ticks until it ends; a final `Err` item
    /// carries the disconnect reason. Malformed frames are dropped inside
    /// the adapter and never surface here.
    Live(BoxStream<'static, Result<PriceTick, ProviderError>>),
}

impl std::fmt::Debug for TickSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snapshot(ticks) => f.debug_tuple("Snapshot").field(&ticks.len()).finish(),
            Self::Live(_) => f.write_str("Live(..)"),
        }
    }
}

/// Trait for upstream market data sources.
///
/// `open()` is the single bounded provider call: a poll for polling
/// sources, connect + subscribe for streaming ones. Adapters never retry
/// or reconnect on their own; the resilience wrapper owns that policy.
#[async_trait]
pub trait PriceProvider: Send + Sync + 'static {
    /// Configured provider name (unique per process).
    fn name(&self) -> &str;

    /// Streaming or polling cadence.
    fn cadence(&self) -> Cadence;

    /// Perform one provider call.
    async fn open(&self) -> Result<TickSession, ProviderError>;
}
