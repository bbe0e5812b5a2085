//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the usecases layer requires from
//! the outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `PriceProvider`: Upstream market data (streaming or polling)
//! - `ClientSink`: Non-blocking push channel to one connected client
//! - `PipelineObserver`: Telemetry hooks for metrics backends

pub mod client_sink;
pub mod price_provider;
pub mod telemetry;
