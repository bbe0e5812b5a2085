//! Market Data Hub - WebSocket Push Transport
//!
//! Accepts client WebSocket connections on the hub route. Every
//! connection gets a UUID, a bounded outbox registered with the
//! subscription registry as its `ClientSink`, and a writer task that
//! drains the outbox into the socket. The reader side handles
//! subscribe/unsubscribe/ping requests.
//!
//! Connections stay open until the client leaves or the server is told to
//! stop, which happens only after the pipeline has drained.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::messages::{ClientMessage, ServerMessage};
use crate::domain::price::AssetClass;
use crate::ports::client_sink::{ClientSink, Frame};
use crate::ports::telemetry::PipelineObserver;
use crate::usecases::registry::{ConnectionId, SubscriptionRegistry};

/// State shared by every connection handler.
pub struct HubState {
    registry: Arc<SubscriptionRegistry>,
    observer: Arc<dyn PipelineObserver>,
    outbox_capacity: usize,
    /// Fires when the server stops; open connections close after flushing.
    stop: broadcast::Sender<()>,
}

impl HubState {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        observer: Arc<dyn PipelineObserver>,
        outbox_capacity: usize,
        stop: broadcast::Sender<()>,
    ) -> Self {
        Self {
            registry,
            observer,
            outbox_capacity: outbox_capacity.max(1),
            stop,
        }
    }

    fn publish_counts(&self) {
        self.observer.clients_changed(
            self.registry.connection_count(),
            self.registry.subscription_count(),
        );
    }

    /// Handle one client text frame and build the reply.
    pub fn handle_text(&self, id: ConnectionId, text: &str) -> ServerMessage<'static> {
        let request: ClientMessage = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                return ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                };
            }
        };

        match request {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Subscribe { asset_class, symbols } => {
                let asset_class = match asset_class.parse::<AssetClass>() {
                    Ok(class) => class,
                    Err(e) => return ServerMessage::Error { message: e.to_string() },
                };
                match self.registry.subscribe(id, asset_class, &symbols) {
                    Ok(symbols) => {
                        self.publish_counts();
                        ServerMessage::Subscribed { asset_class, symbols }
                    }
                    Err(e) => ServerMessage::Error { message: e.to_string() },
                }
            }
            ClientMessage::Unsubscribe { asset_class, symbols } => {
                let asset_class = match asset_class.parse::<AssetClass>() {
                    Ok(class) => class,
                    Err(e) => return ServerMessage::Error { message: e.to_string() },
                };
                let symbols = self.registry.unsubscribe(id, asset_class, &symbols);
                self.publish_counts();
                ServerMessage::Unsubscribed { asset_class, symbols }
            }
        }
    }
}

/// Axum-based WebSocket hub server.
pub struct HubServer {
    state: Arc<HubState>,
    bind_address: String,
    hub_path: String,
}

impl HubServer {
    pub fn new(state: Arc<HubState>, bind_address: impl Into<String>, hub_path: impl Into<String>) -> Self {
        Self {
            state,
            bind_address: bind_address.into(),
            hub_path: hub_path.into(),
        }
    }

    pub fn router(state: Arc<HubState>, hub_path: &str) -> Router {
        Router::new()
            .route(hub_path, get(upgrade))
            .with_state(state)
    }

    /// Serve until the stop signal fires.
    #[instrument(skip(self), fields(address = %self.bind_address, path = %self.hub_path))]
    pub async fn run(self) -> anyhow::Result<()> {
        let app = Self::router(Arc::clone(&self.state), &self.hub_path);
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        let mut stop = self.state.stop.subscribe();

        info!("Market data hub started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await?;

        info!("Market data hub stopped");
        Ok(())
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(state, socket))
}

fn reply(outbox: &mpsc::Sender<Frame>, message: &ServerMessage<'_>) {
    match message.to_frame() {
        Ok(frame) => {
            if let Err(e) = outbox.push(frame) {
                warn!(error = %e, "Dropping reply to client");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize reply"),
    }
}

#[instrument(skip_all, fields(connection = tracing::field::Empty))]
async fn handle_connection(state: Arc<HubState>, socket: WebSocket) {
    let id = Uuid::new_v4();
    tracing::Span::current().record("connection", tracing::field::display(id));

    let (outbox, mut pending) = mpsc::channel::<Frame>(state.outbox_capacity);
    state
        .registry
        .register(id, Arc::new(outbox.clone()) as Arc<dyn ClientSink>);
    state.publish_counts();
    info!("Client connected");

    let (mut sink, mut stream) = socket.split();
    let mut stop = state.stop.subscribe();

    let writer = tokio::spawn(async move {
        while let Some(frame) = pending.recv().await {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let response = state.handle_text(id, &text);
                    reply(&outbox, &response);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Client socket error");
                    break;
                }
            },
        }
    }

    let removed = state.registry.connection_closed(id);
    state.publish_counts();
    drop(outbox);
    let _ = writer.await;
    info!(interests = removed, "Client disconnected");
}
