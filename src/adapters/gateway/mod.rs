//! Client Gateway - WebSocket Push Transport
//!
//! Serves the market data hub that clients connect to for live prices.

pub mod hub;

pub use hub::{HubServer, HubState};
