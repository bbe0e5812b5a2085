//! Client Sink Port - Push Channel to One Connected Client
//!
//! The broadcast dispatcher pushes pre-serialized frames through this
//! trait. Implementations must never block: a slow or dead client shows up
//! as a `DeliveryError`, not as a stalled fan-out.

use std::sync::Arc;

use tokio::sync::mpsc;

/// A serialized server-to-client message, shared across all recipients.
pub type Frame = Arc<str>;

/// Why a single push did not reach its client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Outbox is full; the client is not keeping up.
    #[error("client outbox full")]
    Full,
    /// The client's writer is gone.
    #[error("client connection closed")]
    Closed,
}

/// Non-blocking push target for one client connection.
#[cfg_attr(test, mockall::automock)]
pub trait ClientSink: Send + Sync + 'static {
    /// Queue a frame for the client without waiting.
    fn push(&self, frame: Frame) -> Result<(), DeliveryError>;
}

/// The production sink: a bounded outbox drained by the connection's
/// writer task.
impl ClientSink for mpsc::Sender<Frame> {
    fn push(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}
