//! Integration Tests - End-to-end Pipeline Component Testing
//!
//! Tests the interaction between usecases, ports, and fake adapters:
//! provider → supervisor → dispatch → broadcaster → client outboxes, and
//! the WebSocket hub over a real socket.
//! Uses mockall for trait mocking and tokio::test for async tests.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mockall::mock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use mytrader_pricefeed::adapters::feeds::{ProviderSupervisor, YahooProvider};
use mytrader_pricefeed::adapters::gateway::{HubServer, HubState};
use mytrader_pricefeed::domain::health::{CircuitState, HealthStatus};
use mytrader_pricefeed::domain::price::{AssetClass, PriceTick, SymbolAliases};
use mytrader_pricefeed::ports::client_sink::{ClientSink, DeliveryError, Frame};
use mytrader_pricefeed::ports::price_provider::{Cadence, PriceProvider, ProviderError, TickSession};
use mytrader_pricefeed::ports::telemetry::{NoopObserver, PipelineObserver};
use mytrader_pricefeed::usecases::{
    Broadcaster, FeedEvent, GroupKey, Pipeline, ResiliencePolicy, ResilienceWrapper, SubscriptionRegistry,
};

// ---- Mock Definitions ----

mock! {
    pub Sink {}

    impl ClientSink for Sink {
        fn push(&self, frame: Frame) -> Result<(), DeliveryError>;
    }
}

/// Streams a fixed set of ticks, then stays connected.
struct StreamingFake {
    name: &'static str,
    ticks: Vec<PriceTick>,
}

#[async_trait]
impl PriceProvider for StreamingFake {
    fn name(&self) -> &str {
        self.name
    }

    fn cadence(&self) -> Cadence {
        Cadence::Streaming
    }

    async fn open(&self) -> Result<TickSession, ProviderError> {
        let ticks = self.ticks.clone().into_iter().map(Ok);
        Ok(TickSession::Live(
            futures_util::stream::iter(ticks)
                .chain(futures_util::stream::pending())
                .boxed(),
        ))
    }
}

/// Refuses every connection.
struct DownFake;

#[async_trait]
impl PriceProvider for DownFake {
    fn name(&self) -> &str {
        "yahoo-stocks"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Polling(Duration::from_secs(60))
    }

    async fn open(&self) -> Result<TickSession, ProviderError> {
        Err(ProviderError::Transport("connection refused".to_string()))
    }
}

// ---- Helpers ----

struct Harness {
    registry: Arc<SubscriptionRegistry>,
    broadcaster: Arc<Broadcaster>,
    pipeline: Pipeline,
    observer: Arc<dyn PipelineObserver>,
}

fn harness() -> Harness {
    let registry = Arc::new(SubscriptionRegistry::new());
    let observer: Arc<dyn PipelineObserver> = Arc::new(NoopObserver);
    let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry), Arc::clone(&observer)));
    let pipeline = Pipeline::new(Arc::clone(&broadcaster), Arc::clone(&observer), 64);
    Harness {
        registry,
        broadcaster,
        pipeline,
        observer,
    }
}

fn client(registry: &SubscriptionRegistry, asset_class: AssetClass, symbols: &[&str]) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel::<Frame>(16);
    let id = Uuid::new_v4();
    registry.register(id, Arc::new(tx) as Arc<dyn ClientSink>);
    let symbols: Vec<String> = symbols.iter().map(|s| (*s).to_string()).collect();
    registry.subscribe(id, asset_class, &symbols).unwrap();
    rx
}

fn fast_policy(threshold: u32) -> ResiliencePolicy {
    ResiliencePolicy {
        max_retry_attempts: 1,
        timeout: Duration::from_secs(1),
        failure_threshold: threshold,
        cooldown: Duration::from_secs(60),
        cooldown_multiplier: 2.0,
        max_cooldown: Duration::from_secs(300),
        base_retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
    }
}

fn btc_tick() -> PriceTick {
    PriceTick::new("binance", "BTCUSDT", AssetClass::Crypto, dec!(50000)).with_change_percent(dec!(2.5))
}

fn json(frame: &Frame) -> serde_json::Value {
    serde_json::from_str(frame).unwrap()
}

// ---- Pipeline Tests ----

#[tokio::test]
async fn test_btcusdt_tick_reaches_each_subscriber_once() {
    let h = harness();
    let mut clients = vec![
        client(&h.registry, AssetClass::Crypto, &[]),
        client(&h.registry, AssetClass::Crypto, &[]),
        client(&h.registry, AssetClass::Crypto, &["BTCUSDT"]),
    ];
    let mut stock_client = client(&h.registry, AssetClass::Stock, &[]);

    let resilience = Arc::new(ResilienceWrapper::new([("binance".to_string(), fast_policy(3))]));
    let (events, dispatch) = h.pipeline.spawn_channel("binance");
    let (shutdown_tx, _) = broadcast::channel(1);

    let provider = StreamingFake {
        name: "binance",
        ticks: vec![btc_tick()],
    };
    let supervisor = ProviderSupervisor::new(
        Arc::new(provider),
        Arc::clone(&resilience),
        Arc::clone(&h.observer),
        events,
    )
    .spawn(shutdown_tx.subscribe());

    for rx in &mut clients {
        let frame = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let value = json(&frame);
        assert_eq!(value["type"], "price_update");
        assert_eq!(value["data"]["symbol"], "BTCUSDT");
        assert_eq!(value["data"]["assetClass"], "CRYPTO");
        assert_eq!(value["data"]["price"], "50000");
        assert_eq!(value["data"]["changePercent24h"], "2.5");

        let previous = Decimal::from_str(value["data"]["previousClose"].as_str().unwrap()).unwrap();
        assert_eq!(previous.round_dp(2), dec!(48780.49));
    }

    shutdown_tx.send(()).unwrap();
    supervisor.await.unwrap();
    let stats = dispatch.await.unwrap();

    assert_eq!(stats.delivered, 3);
    for rx in &mut clients {
        assert!(rx.try_recv().is_err(), "each subscriber gets exactly one update");
    }
    assert!(stock_client.try_recv().is_err());
    assert_eq!(resilience.state("binance"), Some(CircuitState::Closed));
}

#[tokio::test]
async fn test_dead_client_does_not_block_fanout() {
    let h = harness();

    let mut dead = MockSink::new();
    dead.expect_push().times(2).returning(|_| Err(DeliveryError::Closed));
    let dead_id = Uuid::new_v4();
    h.registry.register(dead_id, Arc::new(dead));
    h.registry.subscribe(dead_id, AssetClass::Crypto, &[]).unwrap();

    let mut healthy = vec![
        client(&h.registry, AssetClass::Crypto, &[]),
        client(&h.registry, AssetClass::Crypto, &["ETHUSDT"]),
    ];

    let (events, dispatch) = h.pipeline.spawn_channel("binance");
    events.send(FeedEvent::Tick(btc_tick())).await.unwrap();
    events
        .send(FeedEvent::Tick(
            PriceTick::new("binance", "ETHUSDT", AssetClass::Crypto, dec!(3000)).with_change_percent(dec!(-1.2)),
        ))
        .await
        .unwrap();
    drop(events);

    let stats = dispatch.await.unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.delivered, 3);

    let first = healthy[0].recv().await.unwrap();
    let second = healthy[0].recv().await.unwrap();
    assert_eq!(json(&first)["data"]["symbol"], "BTCUSDT");
    assert_eq!(json(&second)["data"]["symbol"], "ETHUSDT");

    let only = healthy[1].recv().await.unwrap();
    assert_eq!(json(&only)["data"]["symbol"], "ETHUSDT");
    assert!(healthy[1].try_recv().is_err());

    // Dead clients stay registered until their connection closes.
    assert_eq!(h.registry.connection_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failing_provider_is_isolated() {
    let h = harness();
    let mut crypto = client(&h.registry, AssetClass::Crypto, &[]);

    let resilience = Arc::new(ResilienceWrapper::new([
        ("binance".to_string(), fast_policy(3)),
        ("yahoo-stocks".to_string(), fast_policy(2)),
    ]));
    let (shutdown_tx, _) = broadcast::channel(1);

    let (down_events, down_dispatch) = h.pipeline.spawn_channel("yahoo-stocks");
    let down = ProviderSupervisor::new(
        Arc::new(DownFake),
        Arc::clone(&resilience),
        Arc::clone(&h.observer),
        down_events,
    )
    .with_exhausted_pause(Duration::from_millis(20))
    .spawn(shutdown_tx.subscribe());

    // Let the stock provider trip its circuit first.
    for _ in 0..50 {
        if resilience.state("yahoo-stocks") == Some(CircuitState::Open) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(resilience.state("yahoo-stocks"), Some(CircuitState::Open));

    let (events, dispatch) = h.pipeline.spawn_channel("binance");
    let up = ProviderSupervisor::new(
        Arc::new(StreamingFake {
            name: "binance",
            ticks: vec![btc_tick()],
        }),
        Arc::clone(&resilience),
        Arc::clone(&h.observer),
        events,
    )
    .spawn(shutdown_tx.subscribe());

    let frame = crypto.recv().await.unwrap();
    assert_eq!(json(&frame)["data"]["symbol"], "BTCUSDT");

    let health = resilience.health_snapshot();
    assert_eq!(health.status(), HealthStatus::Unhealthy);
    assert_eq!(health.provider("binance").unwrap().consecutive_failures, 0);

    shutdown_tx.send(()).unwrap();
    down.await.unwrap();
    up.await.unwrap();
    down_dispatch.await.unwrap();
    dispatch.await.unwrap();
}

/// Connects, then drops before delivering a tick.
struct DroppingStream;

#[async_trait]
impl PriceProvider for DroppingStream {
    fn name(&self) -> &str {
        "binance"
    }

    fn cadence(&self) -> Cadence {
        Cadence::Streaming
    }

    async fn open(&self) -> Result<TickSession, ProviderError> {
        let items = vec![Err(ProviderError::Disconnected("reset".to_string()))];
        Ok(TickSession::Live(futures_util::stream::iter(items).boxed()))
    }
}

#[tokio::test]
async fn test_symbol_subscriber_keeps_updates_on_fallback() {
    use axum::extract::Path;
    use axum::routing::get;

    const BTC: &str = r#"{"chart":{"result":[{"meta":{"currency":"USD","symbol":"BTC-USD","regularMarketTime":1700000000,"regularMarketPrice":50100.0,"chartPreviousClose":49000.0}}],"error":null}}"#;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = axum::Router::new().route(
        "/v8/finance/chart/:symbol",
        get(|Path(_symbol): Path<String>| async move { BTC }),
    );
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let h = harness();
    let mut btc_only = client(&h.registry, AssetClass::Crypto, &["BTCUSDT"]);

    let fallback = YahooProvider::new(
        "yahoo-crypto",
        AssetClass::Crypto,
        vec!["BTC-USD".to_string()],
        format!("http://{addr}"),
        Duration::from_secs(15),
        Duration::from_millis(1),
    )
    .unwrap()
    .with_aliases(SymbolAliases::new([("BTC-USD", "BTCUSDT")]));

    let resilience = Arc::new(ResilienceWrapper::new([
        ("binance".to_string(), fast_policy(2)),
        ("yahoo-crypto".to_string(), fast_policy(3)),
    ]));
    let (events, dispatch) = h.pipeline.spawn_channel("binance");
    let (shutdown_tx, _) = broadcast::channel(1);

    let supervisor = ProviderSupervisor::new(
        Arc::new(DroppingStream),
        Arc::clone(&resilience),
        Arc::clone(&h.observer),
        events,
    )
    .with_fallback(Arc::new(fallback))
    .spawn(shutdown_tx.subscribe());

    let frame = timeout(Duration::from_secs(5), btc_only.recv()).await.unwrap().unwrap();
    let value = json(&frame);
    assert_eq!(value["type"], "batch_price_update");
    assert_eq!(value["data"][0]["symbol"], "BTCUSDT");
    let price = Decimal::from_str(value["data"][0]["price"].as_str().unwrap()).unwrap();
    assert_eq!(price, dec!(50100));
    assert_eq!(value["data"][0]["metadata"]["upstreamSymbol"], "BTC-USD");
    assert_eq!(resilience.state("binance"), Some(CircuitState::Open));

    shutdown_tx.send(()).unwrap();
    supervisor.await.unwrap();
    dispatch.await.unwrap();
}

#[tokio::test]
async fn test_batch_goes_out_as_one_message() {
    let h = harness();
    let mut stocks = client(&h.registry, AssetClass::Stock, &[]);

    let batch = vec![
        PriceTick::new("yahoo-stocks", "AAPL", AssetClass::Stock, dec!(189.5)).with_previous_close(dec!(187)),
        PriceTick::new("yahoo-stocks", "MSFT", AssetClass::Stock, dec!(410)).with_previous_close(dec!(400)),
    ];

    let (events, dispatch) = h.pipeline.spawn_channel("yahoo-stocks");
    events.send(FeedEvent::Batch(batch)).await.unwrap();
    drop(events);
    dispatch.await.unwrap();

    let value = json(&stocks.recv().await.unwrap());
    assert_eq!(value["type"], "batch_price_update");
    assert_eq!(value["data"][0]["symbol"], "AAPL");
    assert_eq!(value["data"][1]["changePercent24h"], "2.5");
    assert!(stocks.try_recv().is_err());
}

// ---- Hub Tests ----

type ClientSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_hub(h: &Harness) -> (String, broadcast::Sender<()>) {
    let (stop_tx, _) = broadcast::channel(1);
    let state = Arc::new(HubState::new(
        Arc::clone(&h.registry),
        Arc::clone(&h.observer),
        16,
        stop_tx.clone(),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = HubServer::router(state, "/hubs/marketdata");
    let mut stop_rx = stop_tx.subscribe();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.recv().await;
            })
            .await
            .unwrap();
    });
    (format!("ws://{addr}/hubs/marketdata"), stop_tx)
}

async fn next_json(socket: &mut ClientSocket) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(2), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_for_connections(registry: &SubscriptionRegistry, expected: usize) {
    for _ in 0..100 {
        if registry.connection_count() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} connections, have {}", registry.connection_count());
}

#[tokio::test]
async fn test_hub_reconnect_restores_updates() {
    let h = harness();
    let (url, stop_tx) = start_hub(&h).await;
    let subscribe = r#"{"type":"subscribe","assetClass":"STOCK","symbols":["AAPL","MSFT"]}"#;
    let aapl = mytrader_pricefeed::domain::normalize(
        PriceTick::new("yahoo-stocks", "AAPL", AssetClass::Stock, dec!(190)).with_previous_close(dec!(187)),
    )
    .unwrap();

    // First session.
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    socket.send(Message::Text(subscribe.into())).await.unwrap();
    let ack = next_json(&mut socket).await;
    assert_eq!(ack["type"], "subscribed");
    assert_eq!(ack["symbols"], serde_json::json!(["AAPL", "MSFT"]));

    assert_eq!(h.broadcaster.broadcast(&aapl).delivered, 1);
    assert_eq!(next_json(&mut socket).await["data"]["symbol"], "AAPL");

    // Drop the connection; the registry forgets it.
    socket.close(None).await.unwrap();
    drop(socket);
    wait_for_connections(&h.registry, 0).await;
    assert_eq!(h.broadcaster.broadcast(&aapl).recipients, 0);

    // Reconnect with a fresh connection and resubscribe.
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    socket.send(Message::Text(subscribe.into())).await.unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "subscribed");

    // Exactly the two symbol interests again, nothing left from the first session.
    assert_eq!(h.registry.connection_count(), 1);
    assert_eq!(h.registry.subscription_count(), 2);
    assert_eq!(h.registry.group_size(&GroupKey::Symbol("AAPL".into())), 1);
    assert_eq!(h.registry.group_size(&GroupKey::Symbol("MSFT".into())), 1);
    assert_eq!(h.registry.group_size(&GroupKey::AssetClass(AssetClass::Stock)), 0);

    assert_eq!(h.broadcaster.broadcast(&aapl).delivered, 1);
    let update = next_json(&mut socket).await;
    assert_eq!(update["type"], "price_update");
    assert_eq!(update["data"]["previousClose"], "187");

    let msft = mytrader_pricefeed::domain::normalize(
        PriceTick::new("yahoo-stocks", "MSFT", AssetClass::Stock, dec!(410)).with_previous_close(dec!(400)),
    )
    .unwrap();
    assert_eq!(h.broadcaster.broadcast(&msft).delivered, 1);
    let update = next_json(&mut socket).await;
    assert_eq!(update["data"]["symbol"], "MSFT");
    assert_eq!(update["data"]["changePercent24h"], "2.5");

    socket.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "pong");

    stop_tx.send(()).unwrap();
}
