//! Metrics and Monitoring Adapters
//!
//! Provides Prometheus metrics export on :9090 and health check
//! endpoints (/live, /ready, /health) via axum 0.7.

pub mod health;
pub mod prometheus;

pub use health::{HealthReport, HealthServer, HealthState, spawn_health_refresh};
pub use prometheus::MetricsRegistry;
