//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (WebSockets, HTTP clients, HTTP servers). Each
//! sub-module groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `feeds`: Upstream market data (Binance stream, Yahoo poller) and supervision
//! - `gateway`: WebSocket hub that pushes updates to clients
//! - `metrics`: Prometheus metrics export and health checks

pub mod feeds;
pub mod gateway;
pub mod metrics;
