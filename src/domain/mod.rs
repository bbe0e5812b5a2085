//! Domain layer - Core price and health models.
//!
//! Pure types and functions with no I/O (hexagonal architecture inner
//! ring). Everything here is testable in isolation.

pub mod health;
pub mod messages;
pub mod normalize;
pub mod price;

// Re-export core types for convenience
pub use health::{CircuitState, HealthStatus, ProviderHealth, RetryStatistics};
pub use messages::{ClientMessage, ServerMessage};
pub use normalize::{NormalizeError, derive_previous_close, normalize};
pub use price::{AssetClass, CanonicalPriceUpdate, Metadata, PriceTick, ProviderName};
