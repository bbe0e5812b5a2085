//! Broadcaster - Fan-out of Canonical Updates
//!
//! Resolves recipients through the registry, serializes each message once
//! and pushes the shared frame to every recipient without waiting. A push
//! that fails is logged and counted; it never stops the remaining pushes
//! and never unsubscribes the connection (the gateway owns that).

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::domain::messages::ServerMessage;
use crate::domain::price::CanonicalPriceUpdate;
use crate::ports::client_sink::DeliveryError;
use crate::ports::telemetry::PipelineObserver;

use super::registry::{Recipient, SubscriptionRegistry};

/// Outcome of one fan-out pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    fn record(&mut self, result: Result<(), DeliveryError>) {
        self.recipients += 1;
        match result {
            Ok(()) => self.delivered += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Pushes updates to subscribed clients.
pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
    observer: Arc<dyn PipelineObserver>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>, observer: Arc<dyn PipelineObserver>) -> Self {
        Self { registry, observer }
    }

    /// Send one `price_update` to the update's asset-class and symbol groups.
    pub fn broadcast(&self, update: &CanonicalPriceUpdate) -> DeliveryReport {
        let recipients = self.registry.targets(update);
        if recipients.is_empty() {
            return DeliveryReport::default();
        }

        let frame = match (ServerMessage::PriceUpdate { data: update }).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(symbol = %update.symbol, error = %e, "Failed to serialize price update");
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport::default();
        for recipient in &recipients {
            report.record(push(recipient, Arc::clone(&frame), &update.symbol));
        }

        debug!(
            symbol = %update.symbol,
            recipients = report.recipients,
            failed = report.failed,
            "Broadcast price update"
        );
        self.observer
            .fanout_completed(update.asset_class, report.delivered, report.failed);
        report
    }

    /// Send one `batch_price_update` per recipient holding only the updates
    /// that recipient subscribed to, in batch order.
    pub fn broadcast_batch(&self, updates: &[CanonicalPriceUpdate]) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let Some(first) = updates.first() else {
            return report;
        };
        if updates.len() == 1 {
            return self.broadcast(first);
        }

        for (recipient, indices) in self.registry.batch_targets(updates) {
            let data: Vec<&CanonicalPriceUpdate> = indices.iter().map(|&i| &updates[i]).collect();
            match (ServerMessage::BatchPriceUpdate { data }).to_frame() {
                Ok(frame) => report.record(push(&recipient, frame, "batch")),
                Err(e) => {
                    error!(connection = %recipient.id, error = %e, "Failed to serialize price batch");
                    report.record(Err(DeliveryError::Closed));
                }
            }
        }

        debug!(
            updates = updates.len(),
            recipients = report.recipients,
            failed = report.failed,
            "Broadcast price batch"
        );
        self.observer
            .fanout_completed(first.asset_class, report.delivered, report.failed);
        report
    }
}

fn push(recipient: &Recipient, frame: Arc<str>, what: &str) -> Result<(), DeliveryError> {
    let result = recipient.sink.push(frame);
    if let Err(e) = &result {
        warn!(connection = %recipient.id, symbol = what, error = %e, "Delivery to client failed");
    }
    result
}
