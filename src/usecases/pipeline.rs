//! Pipeline - Provider Channels and Dispatch Tasks
//!
//! Every provider gets its own bounded channel and its own dispatch task.
//! The task normalizes each event and hands it to the broadcaster in
//! arrival order, so updates for one symbol from one provider are never
//! reordered. A slow provider only backs up its own channel.
//!
//! Shutdown is driven by the senders: once every sender for a channel is
//! dropped, the dispatch task drains what is still queued and returns.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::domain::normalize::normalize;
use crate::domain::price::{CanonicalPriceUpdate, PriceTick};
use crate::ports::telemetry::PipelineObserver;

use super::broadcaster::{Broadcaster, DeliveryReport};

/// Unit of handoff from a provider supervisor to its dispatch task.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// One streamed tick.
    Tick(PriceTick),
    /// One poll's worth of ticks, broadcast together.
    Batch(Vec<PriceTick>),
}

impl FeedEvent {
    pub fn len(&self) -> usize {
        match self {
            Self::Tick(_) => 1,
            Self::Batch(ticks) => ticks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Totals reported by a dispatch task when it finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub events: u64,
    pub ticks: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl DispatchStats {
    fn absorb(&mut self, report: DeliveryReport) {
        self.delivered += report.delivered as u64;
        self.failed += report.failed as u64;
    }
}

/// Normalizes provider events and broadcasts them.
pub struct Dispatcher {
    provider: String,
    broadcaster: Arc<Broadcaster>,
    observer: Arc<dyn PipelineObserver>,
}

impl Dispatcher {
    pub fn new(
        provider: impl Into<String>,
        broadcaster: Arc<Broadcaster>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            provider: provider.into(),
            broadcaster,
            observer,
        }
    }

    fn normalize_one(&self, tick: PriceTick, stats: &mut DispatchStats) -> Option<CanonicalPriceUpdate> {
        stats.ticks += 1;
        self.observer.tick_received(&self.provider);
        match normalize(tick) {
            Ok(update) => Some(update),
            Err(e) => {
                warn!(provider = %self.provider, error = %e, "Dropping tick that failed normalization");
                stats.dropped += 1;
                self.observer.tick_dropped(&self.provider, "normalize");
                None
            }
        }
    }

    /// Process one event synchronously.
    pub fn dispatch(&self, event: FeedEvent, stats: &mut DispatchStats) {
        stats.events += 1;
        match event {
            FeedEvent::Tick(tick) => {
                if let Some(update) = self.normalize_one(tick, stats) {
                    stats.absorb(self.broadcaster.broadcast(&update));
                }
            }
            FeedEvent::Batch(ticks) => {
                let updates: Vec<CanonicalPriceUpdate> = ticks
                    .into_iter()
                    .filter_map(|tick| self.normalize_one(tick, stats))
                    .collect();
                stats.absorb(self.broadcaster.broadcast_batch(&updates));
            }
        }
    }

    /// Consume the channel until every sender is gone.
    #[instrument(skip_all, fields(provider = %self.provider))]
    pub async fn run(self, mut events: mpsc::Receiver<FeedEvent>) -> DispatchStats {
        let mut stats = DispatchStats::default();
        info!("Dispatch task started");

        while let Some(event) = events.recv().await {
            debug!(size = event.len(), "Dispatching feed event");
            self.dispatch(event, &mut stats);
        }

        info!(
            events = stats.events,
            ticks = stats.ticks,
            dropped = stats.dropped,
            "Dispatch task drained and stopped"
        );
        stats
    }
}

/// Shared pieces every provider channel is wired to.
#[derive(Clone)]
pub struct Pipeline {
    broadcaster: Arc<Broadcaster>,
    observer: Arc<dyn PipelineObserver>,
    channel_capacity: usize,
}

impl Pipeline {
    pub fn new(
        broadcaster: Arc<Broadcaster>,
        observer: Arc<dyn PipelineObserver>,
        channel_capacity: usize,
    ) -> Self {
        Self {
            broadcaster,
            observer,
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Create the bounded channel for one provider and spawn its dispatch
    /// task. The task ends after the returned sender (and all its clones)
    /// is dropped and the queue is empty.
    pub fn spawn_channel(&self, provider: &str) -> (mpsc::Sender<FeedEvent>, JoinHandle<DispatchStats>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let dispatcher = Dispatcher::new(
            provider,
            Arc::clone(&self.broadcaster),
            Arc::clone(&self.observer),
        );
        (tx, tokio::spawn(dispatcher.run(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price::AssetClass;
    use crate::ports::client_sink::{ClientSink, Frame};
    use crate::ports::telemetry::NoopObserver;
    use crate::usecases::registry::SubscriptionRegistry;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn pipeline() -> (Arc<SubscriptionRegistry>, Pipeline) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let observer: Arc<dyn PipelineObserver> = Arc::new(NoopObserver);
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry), Arc::clone(&observer)));
        (registry, Pipeline::new(broadcaster, observer, 16))
    }

    fn tick(symbol: &str, price: rust_decimal::Decimal) -> PriceTick {
        PriceTick::new("binance", symbol, AssetClass::Crypto, price).with_change_percent(dec!(1))
    }

    fn client(registry: &SubscriptionRegistry) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel::<Frame>(64);
        let id = Uuid::new_v4();
        registry.register(id, Arc::new(tx) as Arc<dyn ClientSink>);
        registry.subscribe(id, AssetClass::Crypto, &[]).unwrap();
        rx
    }

    #[tokio::test]
    async fn test_queued_events_are_drained_in_order() {
        let (registry, pipeline) = pipeline();
        let mut rx = client(&registry);

        let (tx, handle) = pipeline.spawn_channel("binance");
        for i in 1..=5 {
            tx.send(FeedEvent::Tick(tick("BTCUSDT", rust_decimal::Decimal::from(i))))
                .await
                .unwrap();
        }
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.events, 5);
        assert_eq!(stats.delivered, 5);

        for i in 1..=5 {
            let frame = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["data"]["price"], i.to_string());
        }
    }

    #[tokio::test]
    async fn test_bad_tick_in_batch_is_dropped_alone() {
        let (registry, pipeline) = pipeline();
        let mut rx = client(&registry);

        let (tx, handle) = pipeline.spawn_channel("binance");
        tx.send(FeedEvent::Batch(vec![
            tick("BTCUSDT", dec!(50000)),
            tick("   ", dec!(1)),
            tick("ETHUSDT", dec!(3000)),
        ]))
        .await
        .unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.ticks, 3);
        assert_eq!(stats.dropped, 1);

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "batch_price_update");
        assert_eq!(value["data"][0]["symbol"], "BTCUSDT");
        assert_eq!(value["data"][1]["symbol"], "ETHUSDT");
    }

    #[test]
    fn test_feed_event_len() {
        assert_eq!(FeedEvent::Tick(tick("BTCUSDT", dec!(1))).len(), 1);
        assert!(FeedEvent::Batch(Vec::new()).is_empty());
    }
}
