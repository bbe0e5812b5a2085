//! Use Cases Layer - Application Business Logic
//!
//! Orchestrates domain logic with port interfaces to implement the price
//! pipeline's core workflows.
//!
//! Use cases:
//! - `ResilienceWrapper`: Retry, timeout and circuit breaking per provider
//! - `SubscriptionRegistry`: Which connection wants which updates
//! - `Broadcaster`: Fan-out of canonical updates to subscribers
//! - `Pipeline`: Per-provider channels and dispatch tasks

pub mod broadcaster;
pub mod pipeline;
pub mod registry;
pub mod resilience;

pub use broadcaster::{Broadcaster, DeliveryReport};
pub use pipeline::{DispatchStats, Dispatcher, FeedEvent, Pipeline};
pub use registry::{ConnectionId, GroupKey, Interest, RegistryError, SubscriptionRegistry};
pub use resilience::{HealthSnapshot, ResilienceError, ResiliencePolicy, ResilienceWrapper};
