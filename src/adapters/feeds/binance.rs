//! Binance WebSocket Feed - Streaming 24h Ticker Source
//!
//! Connects to Binance's combined 24h ticker stream. Each ticker frame
//! becomes one `PriceTick` carrying the last price, the 24h percent change
//! and base volume; quote volume and the 24h high/low ride along as
//! metadata. Numeric strings are parsed straight into `Decimal`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future::ready;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, instrument, warn};

use crate::config::ProviderConfig;
use crate::domain::price::{AssetClass, Metadata, PriceTick, SymbolAliases};
use crate::ports::price_provider::{Cadence, PriceProvider, ProviderError, TickSession};

/// Public market data endpoint.
pub const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443";

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Deserialize)]
struct CombinedFrame {
    data: TickerEvent,
}

/// 24hr ticker payload. Field names are single letters on the wire and
/// case-sensitive (`c` is last price, `C` is close time).
#[derive(Debug, Deserialize)]
struct TickerEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "P")]
    change_percent: String,
    #[serde(rename = "v")]
    base_volume: String,
    #[serde(rename = "q")]
    quote_volume: Option<String>,
    #[serde(rename = "h")]
    high: Option<String>,
    #[serde(rename = "l")]
    low: Option<String>,
    #[serde(rename = "E")]
    event_time_ms: i64,
}

fn decimal(field: &str, raw: &str) -> Result<Decimal, ProviderError> {
    Decimal::from_str(raw).map_err(|e| ProviderError::Malformed(format!("{field}={raw}: {e}")))
}

/// Parse one combined-stream text frame into a tick.
pub fn parse_ticker(provider: &str, asset_class: AssetClass, text: &str) -> Result<PriceTick, ProviderError> {
    let frame: CombinedFrame =
        serde_json::from_str(text).map_err(|e| ProviderError::Malformed(e.to_string()))?;
    let event = frame.data;

    let price = decimal("c", &event.last_price)?;
    let change = decimal("P", &event.change_percent)?;
    let volume = decimal("v", &event.base_volume)?;

    let mut tick = PriceTick::new(provider, event.symbol, asset_class, price)
        .with_change_percent(change)
        .with_volume(volume);

    if let Some(ts) = DateTime::<Utc>::from_timestamp_millis(event.event_time_ms) {
        tick = tick.with_exchange_time(ts);
    }

    let mut extras = Metadata::new();
    for (key, value) in [
        ("quoteVolume", event.quote_volume),
        ("high24h", event.high),
        ("low24h", event.low),
    ] {
        if let Some(v) = value {
            extras.insert(key.to_string(), Value::String(v));
        }
    }
    tick.extras = extras;

    Ok(tick)
}

/// Map a handshake failure into the provider error taxonomy.
fn connect_error(error: WsError) -> ProviderError {
    match error {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                ProviderError::Auth(format!("handshake rejected with HTTP {status}"))
            } else if status == 429 {
                ProviderError::RateLimited
            } else {
                ProviderError::Upstream {
                    status,
                    message: "websocket handshake rejected".to_string(),
                }
            }
        }
        other => ProviderError::Transport(other.to_string()),
    }
}

/// Binance 24h ticker stream provider.
pub struct BinanceProvider {
    name: String,
    asset_class: AssetClass,
    symbols: Vec<String>,
    ws_url: String,
    aliases: SymbolAliases,
}

impl BinanceProvider {
    pub fn new(
        name: impl Into<String>,
        asset_class: AssetClass,
        symbols: Vec<String>,
        ws_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            asset_class,
            symbols,
            ws_url: ws_url.into(),
            aliases: SymbolAliases::default(),
        }
    }

    /// Publish ticks under renamed symbols.
    #[must_use]
    pub fn with_aliases(mut self, aliases: SymbolAliases) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn from_config(config: &ProviderConfig) -> Self {
        Self::new(
            config.name.clone(),
            config.asset_class,
            config.symbols.clone(),
            config.url.clone().unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
        )
        .with_aliases(config.aliases())
    }

    /// Combined stream URL for every configured symbol.
    pub fn stream_url(&self) -> String {
        let streams: Vec<String> = self
            .symbols
            .iter()
            .map(|s| format!("{}@ticker", s.trim().to_ascii_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.ws_url.trim_end_matches('/'), streams.join("/"))
    }
}

#[async_trait]
impl PriceProvider for BinanceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn cadence(&self) -> Cadence {
        Cadence::Streaming
    }

    #[instrument(skip(self), fields(provider = %self.name))]
    async fn open(&self) -> Result<TickSession, ProviderError> {
        let url = self.stream_url();
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(connect_error)?;
        info!(symbols = self.symbols.len(), "Binance WebSocket connected");

        let provider = self.name.clone();
        let asset_class = self.asset_class;
        let aliases = self.aliases.clone();

        let ticks = ws_stream.filter_map(move |msg| {
            let item = match msg {
                Ok(Message::Text(text)) => match parse_ticker(&provider, asset_class, &text) {
                    Ok(mut tick) => {
                        aliases.apply(&mut tick);
                        Some(Ok(tick))
                    }
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "Dropping unparseable Binance frame");
                        None
                    }
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame.map_or_else(|| "closed by server".to_string(), |f| f.reason.to_string());
                    Some(Err(ProviderError::Disconnected(reason)))
                }
                Ok(Message::Ping(data)) => {
                    // Pong is handled automatically by tungstenite
                    debug!(provider = %provider, len = data.len(), "Binance ping received");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(ProviderError::Disconnected(e.to_string()))),
            };
            ready(item)
        });

        Ok(TickSession::Live(ticks.boxed()))
    }
}
