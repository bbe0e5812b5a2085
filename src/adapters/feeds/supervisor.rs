//! Provider Supervisor - Lifecycle Management for One Provider
//!
//! Runs one provider under the resilience wrapper and feeds its ticks into
//! the provider's pipeline channel. Uses `tokio::select!` so shutdown is
//! observed while connecting, streaming and sleeping.
//!
//! - Polling providers: one snapshot per interval, sent as a batch.
//! - Streaming providers: ticks pumped one by one until the stream drops;
//!   the disconnect is reported to the wrapper as a failure.
//! - While the primary's circuit is Open the configured fallback runs
//!   (under its own circuit) until the primary's cooldown elapses.
//! - A fatal error stops the supervisor.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{error, info, instrument, warn};

use crate::domain::price::PriceTick;
use crate::ports::price_provider::{Cadence, PriceProvider, ProviderError, TickSession};
use crate::ports::telemetry::PipelineObserver;
use crate::usecases::pipeline::FeedEvent;
use crate::usecases::resilience::{ResilienceError, ResilienceWrapper};

/// Pause after a call exhausted its retries, before the next attempt.
const EXHAUSTED_PAUSE: Duration = Duration::from_secs(5);

/// Whether the supervisor loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// How a live session ended.
enum SessionEnd {
    Shutdown,
    Deadline,
    ChannelClosed,
    Failed { error: ProviderError, ticks: u64 },
}

/// Supervises one provider and its optional fallback.
pub struct ProviderSupervisor {
    primary: Arc<dyn PriceProvider>,
    fallback: Option<Arc<dyn PriceProvider>>,
    resilience: Arc<ResilienceWrapper>,
    observer: Arc<dyn PipelineObserver>,
    events: mpsc::Sender<FeedEvent>,
    exhausted_pause: Duration,
}

impl ProviderSupervisor {
    pub fn new(
        primary: Arc<dyn PriceProvider>,
        resilience: Arc<ResilienceWrapper>,
        observer: Arc<dyn PipelineObserver>,
        events: mpsc::Sender<FeedEvent>,
    ) -> Self {
        Self {
            primary,
            fallback: None,
            resilience,
            observer,
            events,
            exhausted_pause: EXHAUSTED_PAUSE,
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn PriceProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    #[must_use]
    pub fn with_exhausted_pause(mut self, pause: Duration) -> Self {
        self.exhausted_pause = pause;
        self
    }

    /// Spawn the supervisor loop. The task drops its channel sender when
    /// it returns, which lets the dispatch task drain and finish.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    #[instrument(skip_all, fields(provider = %self.primary.name()))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(fallback = ?self.fallback.as_ref().map(|f| f.name().to_string()), "Provider supervisor started");

        let primary = Arc::clone(&self.primary);
        let mut idle_sessions = 0u32;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                outcome = self.call(primary.as_ref()) => outcome,
            };

            let flow = match outcome {
                Ok(TickSession::Snapshot(ticks)) => {
                    if self.send_batch(ticks).await == Flow::Stop {
                        break;
                    }
                    pause(&mut shutdown, poll_interval(primary.as_ref())).await
                }
                Ok(TickSession::Live(stream)) => {
                    match self.pump(primary.as_ref(), stream, &mut shutdown, None).await {
                        SessionEnd::Shutdown | SessionEnd::ChannelClosed => Flow::Stop,
                        SessionEnd::Deadline => Flow::Continue,
                        SessionEnd::Failed { error, ticks } => {
                            if error.is_fatal() {
                                error!(error = %error, "Provider stream failed fatally, stopping");
                                break;
                            }
                            idle_sessions = if ticks == 0 { idle_sessions.saturating_add(1) } else { 1 };
                            let delay = self
                                .resilience
                                .policy(primary.name())
                                .map_or(EXHAUSTED_PAUSE, |p| p.backoff(idle_sessions));
                            warn!(error = %error, ticks, delay_ms = delay.as_millis() as u64, "Provider stream ended, reconnecting");
                            pause(&mut shutdown, delay).await
                        }
                    }
                }
                Err(ResilienceError::CircuitOpen { retry_after, .. }) => match &self.fallback {
                    Some(fallback) => self.run_fallback(fallback.as_ref(), retry_after, &mut shutdown).await,
                    None => pause(&mut shutdown, retry_after).await,
                },
                Err(ResilienceError::Exhausted { attempts, last, .. }) => {
                    warn!(attempts, error = %last, "Provider call exhausted retries");
                    pause(&mut shutdown, self.exhausted_pause).await
                }
                Err(e @ (ResilienceError::Fatal { .. } | ResilienceError::UnknownProvider(_))) => {
                    error!(error = %e, "Provider supervisor stopping");
                    break;
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        info!("Provider supervisor stopped");
    }

    /// One resilience-wrapped `open()` call, timed for metrics.
    ///
    /// A streaming handshake settles nothing: the session's first tick or
    /// its disconnect decides the outcome in `pump`.
    async fn call(&self, provider: &dyn PriceProvider) -> Result<TickSession, ResilienceError> {
        let started = Instant::now();
        let outcome = match provider.cadence() {
            Cadence::Streaming => {
                self.resilience
                    .execute_deferred(provider.name(), || provider.open())
                    .await
            }
            Cadence::Polling(_) => self.resilience.execute(provider.name(), || provider.open()).await,
        };
        self.observer
            .provider_call(provider.name(), started.elapsed(), outcome.is_ok());
        outcome
    }

    async fn send_batch(&self, ticks: Vec<PriceTick>) -> Flow {
        if ticks.is_empty() {
            return Flow::Continue;
        }
        if self.events.send(FeedEvent::Batch(ticks)).await.is_err() {
            warn!("Pipeline channel closed");
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Forward ticks from a live session until it ends.
    async fn pump(
        &self,
        provider: &dyn PriceProvider,
        mut stream: BoxStream<'static, Result<PriceTick, ProviderError>>,
        shutdown: &mut broadcast::Receiver<()>,
        deadline: Option<Instant>,
    ) -> SessionEnd {
        let mut ticks = 0u64;

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => break SessionEnd::Shutdown,
                () = until(deadline) => break SessionEnd::Deadline,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(tick)) => {
                    if ticks == 0 {
                        self.resilience.report_success(provider.name());
                    }
                    ticks += 1;
                    if self.events.send(FeedEvent::Tick(tick)).await.is_err() {
                        warn!("Pipeline channel closed");
                        break SessionEnd::ChannelClosed;
                    }
                }
                Some(Err(error)) => {
                    self.resilience.report_failure(provider.name(), &error);
                    break SessionEnd::Failed { error, ticks };
                }
                None => {
                    let error = ProviderError::Disconnected("stream ended".to_string());
                    self.resilience.report_failure(provider.name(), &error);
                    break SessionEnd::Failed { error, ticks };
                }
            }
        };

        // Ended without an outcome: free a HalfOpen trial that never ticked.
        if !matches!(end, SessionEnd::Failed { .. }) {
            self.resilience.release_trial(provider.name());
        }
        end
    }

    /// Serve from the fallback for `window`, then hand back to the primary.
    async fn run_fallback(
        &self,
        fallback: &dyn PriceProvider,
        window: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Flow {
        let deadline = Instant::now() + window;
        info!(
            fallback = %fallback.name(),
            window_ms = window.as_millis() as u64,
            "Primary circuit open, switching to fallback"
        );

        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());

            let outcome = tokio::select! {
                biased;
                _ = shutdown.recv() => return Flow::Stop,
                () = sleep_until(deadline) => break,
                outcome = self.call(fallback) => outcome,
            };

            let flow = match outcome {
                Ok(TickSession::Snapshot(ticks)) => {
                    if self.send_batch(ticks).await == Flow::Stop {
                        return Flow::Stop;
                    }
                    pause(shutdown, poll_interval(fallback).min(remaining)).await
                }
                Ok(TickSession::Live(stream)) => match self.pump(fallback, stream, shutdown, Some(deadline)).await {
                    SessionEnd::Shutdown | SessionEnd::ChannelClosed => Flow::Stop,
                    SessionEnd::Deadline => break,
                    SessionEnd::Failed { error, .. } => {
                        warn!(fallback = %fallback.name(), error = %error, "Fallback stream ended");
                        pause(shutdown, self.exhausted_pause.min(remaining)).await
                    }
                },
                Err(ResilienceError::CircuitOpen { retry_after, .. }) => {
                    pause(shutdown, retry_after.min(remaining)).await
                }
                Err(e) => {
                    warn!(fallback = %fallback.name(), error = %e, "Fallback call failed");
                    pause(shutdown, self.exhausted_pause.min(remaining)).await
                }
            };

            if flow == Flow::Stop {
                return Flow::Stop;
            }
        }

        info!(fallback = %fallback.name(), "Fallback window over, retrying primary");
        Flow::Continue
    }
}

fn poll_interval(provider: &dyn PriceProvider) -> Duration {
    match provider.cadence() {
        Cadence::Polling(interval) => interval,
        Cadence::Streaming => Duration::ZERO,
    }
}

/// Sleep unless shutdown arrives first.
async fn pause(shutdown: &mut broadcast::Receiver<()>, duration: Duration) -> Flow {
    tokio::select! {
        biased;
        _ = shutdown.recv() => Flow::Stop,
        () = sleep(duration) => Flow::Continue,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
