//! Yahoo Finance Poller - Polling Quote Source
//!
//! Each poll requests the chart endpoint once per configured symbol and
//! returns the results as one snapshot batch. Requests are spaced by the
//! provider's minimum request interval. A symbol the upstream does not
//! know is dropped from the batch; auth and rate-limit responses abort the
//! whole poll so the resilience layer can act on them.

use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{Number, Value};
use tracing::{debug, instrument, warn};

use crate::config::ProviderConfig;
use crate::domain::price::{AssetClass, Metadata, PriceTick, SymbolAliases};
use crate::ports::price_provider::{Cadence, PriceProvider, ProviderError, TickSession};

/// Public chart API host.
pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    symbol: Option<String>,
    currency: Option<String>,
    exchange_name: Option<String>,
    instrument_type: Option<String>,
    regular_market_price: Option<Number>,
    chart_previous_close: Option<Number>,
    previous_close: Option<Number>,
    regular_market_volume: Option<Number>,
    regular_market_time: Option<i64>,
}

/// JSON number to `Decimal` through its textual form, so `189.5` stays
/// exactly `189.5`.
fn to_decimal(n: &Number) -> Option<Decimal> {
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Parse one chart response body into a tick for `requested`.
pub fn parse_chart(
    provider: &str,
    asset_class: AssetClass,
    requested: &str,
    body: &str,
) -> Result<PriceTick, ProviderError> {
    let response: ChartResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    if let Some(err) = response.chart.error {
        return Err(ProviderError::Malformed(format!(
            "{requested}: {} {}",
            err.code.unwrap_or_default(),
            err.description.unwrap_or_default()
        )));
    }

    let meta = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .map(|r| r.meta)
        .ok_or_else(|| ProviderError::Malformed(format!("{requested}: empty chart result")))?;

    let price = meta
        .regular_market_price
        .as_ref()
        .and_then(to_decimal)
        .ok_or_else(|| ProviderError::Malformed(format!("{requested}: missing regularMarketPrice")))?;

    let symbol = meta.symbol.unwrap_or_else(|| requested.to_string());
    let mut tick = PriceTick::new(provider, symbol, asset_class, price);

    if let Some(close) = meta
        .chart_previous_close
        .as_ref()
        .or(meta.previous_close.as_ref())
        .and_then(to_decimal)
    {
        tick = tick.with_previous_close(close);
    }
    if let Some(volume) = meta.regular_market_volume.as_ref().and_then(to_decimal) {
        tick = tick.with_volume(volume);
    }
    if let Some(ts) = meta.regular_market_time.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)) {
        tick = tick.with_exchange_time(ts);
    }

    let mut extras = Metadata::new();
    for (key, value) in [
        ("currency", meta.currency),
        ("exchange", meta.exchange_name),
        ("instrumentType", meta.instrument_type),
    ] {
        if let Some(v) = value {
            extras.insert(key.to_string(), Value::String(v));
        }
    }
    tick.extras = extras;

    Ok(tick)
}

/// Outcome of fetching one symbol.
enum Fetch {
    Tick(PriceTick),
    /// The symbol is unusable this round; the rest of the poll continues.
    Skip(ProviderError),
}

/// Yahoo Finance chart poller.
pub struct YahooProvider {
    name: String,
    asset_class: AssetClass,
    symbols: Vec<String>,
    base_url: String,
    interval: Duration,
    client: Client,
    limiter: Option<DefaultDirectRateLimiter>,
    aliases: SymbolAliases,
}

impl YahooProvider {
    pub fn new(
        name: impl Into<String>,
        asset_class: AssetClass,
        symbols: Vec<String>,
        base_url: impl Into<String>,
        interval: Duration,
        min_request_interval: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build Yahoo HTTP client")?;

        let limiter = Quota::with_period(min_request_interval)
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));

        Ok(Self {
            name: name.into(),
            asset_class,
            symbols,
            base_url: base_url.into(),
            interval,
            client,
            limiter,
            aliases: SymbolAliases::default(),
        })
    }

    /// Publish ticks under renamed symbols.
    #[must_use]
    pub fn with_aliases(mut self, aliases: SymbolAliases) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Self::new(
            config.name.clone(),
            config.asset_class,
            config.symbols.clone(),
            config.url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            config.update_interval(),
            config.min_request_interval(),
        )
        .map(|provider| provider.with_aliases(config.aliases()))
        .with_context(|| format!("Failed to create Yahoo provider '{}'", config.name))
    }

    fn chart_url(&self, symbol: &str) -> String {
        format!(
            "{}/v8/finance/chart/{}",
            self.base_url.trim_end_matches('/'),
            symbol.trim()
        )
    }

    async fn fetch(&self, symbol: &str) -> Result<Fetch, ProviderError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let response = self
            .client
            .get(self.chart_url(symbol))
            .query(&[("interval", "1d"), ("range", "1d")])
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ProviderError::Auth(format!("HTTP {status} for {symbol}")));
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(ProviderError::RateLimited),
            s if s.is_server_error() => {
                return Err(ProviderError::Upstream {
                    status: s.as_u16(),
                    message: format!("chart request for {symbol} failed"),
                });
            }
            StatusCode::NOT_FOUND => {
                return Ok(Fetch::Skip(ProviderError::Malformed(format!("{symbol}: not found"))));
            }
            _ => {}
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(match parse_chart(&self.name, self.asset_class, symbol, &body) {
            Ok(mut tick) => {
                self.aliases.apply(&mut tick);
                Fetch::Tick(tick)
            }
            Err(e) => Fetch::Skip(e),
        })
    }
}

#[async_trait]
impl PriceProvider for YahooProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn cadence(&self) -> Cadence {
        Cadence::Polling(self.interval)
    }

    #[instrument(skip(self), fields(provider = %self.name))]
    async fn open(&self) -> Result<TickSession, ProviderError> {
        let mut ticks = Vec::with_capacity(self.symbols.len());
        let mut last_skip = None;

        for symbol in &self.symbols {
            match self.fetch(symbol).await? {
                Fetch::Tick(tick) => ticks.push(tick),
                Fetch::Skip(e) => {
                    warn!(symbol = %symbol, error = %e, "Dropping symbol from poll");
                    last_skip = Some(e);
                }
            }
        }

        if ticks.is_empty() {
            return Err(last_skip
                .unwrap_or_else(|| ProviderError::Malformed("no symbols configured".to_string())));
        }

        debug!(count = ticks.len(), "Yahoo poll complete");
        Ok(TickSession::Snapshot(ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use rust_decimal_macros::dec;

    const AAPL: &str = r#"{"chart":{"result":[{"meta":{"currency":"USD","symbol":"AAPL","exchangeName":"NMS","instrumentType":"EQUITY","regularMarketTime":1700000000,"regularMarketPrice":189.5,"chartPreviousClose":187.0,"regularMarketVolume":51234567}}],"error":null}}"#;

    const NOT_FOUND: &str = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;

    #[test]
    fn test_parse_chart_fields() {
        let tick = parse_chart("yahoo", AssetClass::Stock, "AAPL", AAPL).unwrap();

        assert_eq!(tick.symbol, "AAPL");
        assert_eq!(tick.price, dec!(189.5));
        assert_eq!(tick.previous_close, Some(dec!(187)));
        assert_eq!(tick.volume, Some(dec!(51234567)));
        assert!(tick.change_percent_24h.is_none());
        assert_eq!(tick.exchange_time.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(tick.extras["currency"], Value::String("USD".into()));
        assert_eq!(tick.extras["instrumentType"], Value::String("EQUITY".into()));
    }

    #[test]
    fn test_previous_close_fallback() {
        let body = AAPL.replace("chartPreviousClose", "previousClose");
        let tick = parse_chart("yahoo", AssetClass::Stock, "AAPL", &body).unwrap();
        assert_eq!(tick.previous_close, Some(dec!(187)));
    }

    #[test]
    fn test_chart_error_is_malformed() {
        assert!(matches!(
            parse_chart("yahoo", AssetClass::Stock, "NOPE", NOT_FOUND),
            Err(ProviderError::Malformed(_))
        ));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn provider(base_url: String, symbols: &[&str]) -> YahooProvider {
        YahooProvider::new(
            "yahoo-stocks",
            AssetClass::Stock,
            symbols.iter().map(|s| (*s).to_string()).collect(),
            base_url,
            Duration::from_secs(60),
            Duration::from_millis(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_poll_skips_unknown_symbol() {
        let router = Router::new().route(
            "/v8/finance/chart/:symbol",
            get(|Path(symbol): Path<String>| async move {
                if symbol == "AAPL" {
                    (HttpStatus::OK, AAPL)
                } else {
                    (HttpStatus::NOT_FOUND, NOT_FOUND)
                }
            }),
        );
        let yahoo = provider(serve(router).await, &["AAPL", "ZZZZ"]);

        let TickSession::Snapshot(ticks) = yahoo.open().await.unwrap() else {
            panic!("expected a snapshot");
        };
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].symbol, "AAPL");
    }

    #[tokio::test]
    async fn test_poll_publishes_aliased_symbol() {
        const BTC: &str = r#"{"chart":{"result":[{"meta":{"currency":"USD","symbol":"BTC-USD","instrumentType":"CRYPTOCURRENCY","regularMarketTime":1700000000,"regularMarketPrice":50000.5,"chartPreviousClose":49000.0}}],"error":null}}"#;
        let router = Router::new().route(
            "/v8/finance/chart/:symbol",
            get(|Path(symbol): Path<String>| async move {
                if symbol == "BTC-USD" {
                    (HttpStatus::OK, BTC)
                } else {
                    (HttpStatus::NOT_FOUND, NOT_FOUND)
                }
            }),
        );
        let yahoo = provider(serve(router).await, &["BTC-USD"])
            .with_aliases(SymbolAliases::new([("BTC-USD", "BTCUSDT")]));

        let TickSession::Snapshot(ticks) = yahoo.open().await.unwrap() else {
            panic!("expected a snapshot");
        };
        assert_eq!(ticks[0].symbol, "BTCUSDT");
        assert_eq!(ticks[0].price, dec!(50000.5));
        assert_eq!(ticks[0].extras["upstreamSymbol"], Value::String("BTC-USD".into()));
    }

    #[tokio::test]
    async fn test_poll_status_mapping() {
        let router = Router::new()
            .route("/denied/v8/finance/chart/:symbol", get(|| async { HttpStatus::FORBIDDEN }))
            .route("/busy/v8/finance/chart/:symbol", get(|| async { HttpStatus::TOO_MANY_REQUESTS }))
            .route("/down/v8/finance/chart/:symbol", get(|| async { HttpStatus::BAD_GATEWAY }));
        let base = serve(router).await;

        let denied = provider(format!("{base}/denied"), &["AAPL"]).open().await.unwrap_err();
        assert!(denied.is_fatal());

        let busy = provider(format!("{base}/busy"), &["AAPL"]).open().await.unwrap_err();
        assert_eq!(busy, ProviderError::RateLimited);

        let down = provider(format!("{base}/down"), &["AAPL"]).open().await.unwrap_err();
        assert!(matches!(down, ProviderError::Upstream { status: 502, .. }));
        assert!(down.is_retryable());
    }
}
