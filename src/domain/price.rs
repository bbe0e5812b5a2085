//! Core price types.
//!
//! Defines the raw per-provider tick and the canonical, provider-agnostic
//! update that flows from normalization to the broadcast dispatcher.
//! Prices are `Decimal` end to end and serialize as JSON strings, so no
//! precision is lost on the way to clients.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lightweight provider identifier used at the ports boundary.
pub type ProviderName = String;

/// Broad category of tradable instrument, used as a coarse subscription group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetClass {
    Crypto,
    Stock,
    Forex,
    General,
}

impl AssetClass {
    /// All asset classes, in wire order.
    pub const ALL: [Self; 4] = [Self::Crypto, Self::Stock, Self::Forex, Self::General];

    /// Wire name (`CRYPTO`, `STOCK`, ...).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Crypto => "CRYPTO",
            Self::Stock => "STOCK",
            Self::Forex => "FOREX",
            Self::General => "GENERAL",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an asset class name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown asset class: {0}")]
pub struct UnknownAssetClass(pub String);

impl FromStr for AssetClass {
    type Err = UnknownAssetClass;

    /// Case-insensitive; accepts the wire names plus a few aliases clients send.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRYPTO" | "CRYPTOCURRENCY" => Ok(Self::Crypto),
            "STOCK" | "STOCKS" | "EQUITY" => Ok(Self::Stock),
            "FOREX" | "FX" => Ok(Self::Forex),
            "GENERAL" => Ok(Self::General),
            _ => Err(UnknownAssetClass(s.to_string())),
        }
    }
}

/// Open metadata map for provider-specific extras.
///
/// `BTreeMap` keeps serialized key order stable across runs.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Per-provider renames from upstream symbol to published symbol.
///
/// Lets a fallback source that spells an instrument differently
/// (`BTC-USD`) publish under the primary's name (`BTCUSDT`), so symbol
/// subscribers keep receiving updates across a failover. Lookups ignore
/// case; unmapped symbols pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolAliases(BTreeMap<String, String>);

impl SymbolAliases {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| {
                    (
                        k.as_ref().trim().to_ascii_uppercase(),
                        v.as_ref().trim().to_ascii_uppercase(),
                    )
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Symbol to publish for `upstream`.
    pub fn publish(&self, upstream: &str) -> String {
        let key = upstream.trim().to_ascii_uppercase();
        match self.0.get(&key) {
            Some(alias) => alias.clone(),
            None => upstream.to_string(),
        }
    }

    /// Rename a tick in place, keeping the upstream spelling in its extras.
    pub fn apply(&self, tick: &mut PriceTick) {
        let published = self.publish(&tick.symbol);
        if published != tick.symbol {
            let upstream = std::mem::replace(&mut tick.symbol, published);
            tick.extras
                .insert("upstreamSymbol".to_string(), serde_json::Value::String(upstream));
        }
    }
}

/// One raw price observation from an upstream provider.
///
/// Transient: built by an adapter, consumed by normalization, discarded.
/// Sources differ in which optional fields they fill: a streaming exchange
/// reports `change_percent_24h`, a quote poller reports `previous_close`.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceTick {
    /// Provider that produced the tick.
    pub provider: ProviderName,
    /// Venue symbol as reported upstream (e.g., "BTCUSDT", "AAPL").
    pub symbol: String,
    /// Asset class configured for the provider.
    pub asset_class: AssetClass,
    /// Last traded / quoted price.
    pub price: Decimal,
    /// 24h percent change, when the source reports it.
    pub change_percent_24h: Option<Decimal>,
    /// Previous session close, when the source reports it.
    pub previous_close: Option<Decimal>,
    /// Traded volume, when available.
    pub volume: Option<Decimal>,
    /// Upstream event time; falls back to `received_at` when absent.
    pub exchange_time: Option<DateTime<Utc>>,
    /// Local receive time.
    pub received_at: DateTime<Utc>,
    /// Provider-specific extras carried through to the canonical update.
    pub extras: Metadata,
}

impl PriceTick {
    /// Minimal tick with only the required fields set.
    pub fn new(
        provider: impl Into<ProviderName>,
        symbol: impl Into<String>,
        asset_class: AssetClass,
        price: Decimal,
    ) -> Self {
        Self {
            provider: provider.into(),
            symbol: symbol.into(),
            asset_class,
            price,
            change_percent_24h: None,
            previous_close: None,
            volume: None,
            exchange_time: None,
            received_at: Utc::now(),
            extras: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_change_percent(mut self, pct: Decimal) -> Self {
        self.change_percent_24h = Some(pct);
        self
    }

    #[must_use]
    pub fn with_previous_close(mut self, close: Decimal) -> Self {
        self.previous_close = Some(close);
        self
    }

    #[must_use]
    pub fn with_volume(mut self, volume: Decimal) -> Self {
        self.volume = Some(volume);
        self
    }

    #[must_use]
    pub fn with_exchange_time(mut self, ts: DateTime<Utc>) -> Self {
        self.exchange_time = Some(ts);
        self
    }
}

/// The normalized, provider-agnostic price record broadcast downstream.
///
/// Built once per tick by normalization and never mutated afterwards.
/// When `previous_close` is present,
/// `change_percent_24h == (price - previous_close) / previous_close * 100`
/// holds within rounding tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalPriceUpdate {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub price: Decimal,
    pub previous_close: Option<Decimal>,
    pub change_percent_24h: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
}
