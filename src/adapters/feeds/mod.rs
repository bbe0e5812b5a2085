//! Market Data Feed Adapters - Upstream Price Sources
//!
//! Provides price sources behind the `PriceProvider` port:
//! - Binance: Streaming 24h ticker over WebSocket
//! - Yahoo: Polled chart quotes over HTTPS
//! - Supervisor: Runs one provider under the resilience wrapper

pub mod binance;
pub mod supervisor;
pub mod yahoo;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{ProviderConfig, ProviderKind};
use crate::ports::price_provider::PriceProvider;

pub use binance::BinanceProvider;
pub use supervisor::ProviderSupervisor;
pub use yahoo::YahooProvider;

/// Build the adapter a provider entry asks for.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn PriceProvider>> {
    Ok(match config.kind {
        ProviderKind::Binance => Arc::new(BinanceProvider::from_config(config)),
        ProviderKind::Yahoo => Arc::new(YahooProvider::from_config(config)?),
    })
}
