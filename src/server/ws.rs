use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;

use super::dto::WsQuery;
use super::handlers::AppState;
use crate::hub::envelope::Envelope;
use crate::hub::transport::{DeliveryError, Transport};

/// Write half of an axum WebSocket, registered with the hub
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
    connected: bool,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink,
            connected: true,
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), DeliveryError> {
        if !self.connected {
            return Err(DeliveryError::Disconnected);
        }
        let text = serde_json::to_string(envelope)?;
        if let Err(e) = self.sink.send(Message::Text(text)).await {
            self.connected = false;
            return Err(DeliveryError::Transport(e.to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) {
        if self.connected {
            self.connected = false;
            self.sink.close().await.ok();
        }
    }
}

/// A text frame received from a client
#[derive(Debug, PartialEq)]
enum Inbound {
    Heartbeat,
    Ping(Value),
    Unknown(String),
    Malformed,
}

fn parse_inbound(text: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Inbound::Malformed;
    };
    let Some(kind) = value.get("type").and_then(|t| t.as_str()) else {
        return Inbound::Malformed;
    };

    match kind {
        "heartbeat" => Inbound::Heartbeat,
        "ping" => Inbound::Ping(value.get("data").cloned().unwrap_or(Value::Null)),
        other => Inbound::Unknown(other.to_string()),
    }
}

/// Direct reply to a client frame; heartbeats are answered by the hub itself
fn reply_for(inbound: Inbound) -> Option<Envelope> {
    match inbound {
        Inbound::Heartbeat => None,
        Inbound::Ping(data) => Some(Envelope::pong(data)),
        Inbound::Unknown(kind) => Some(Envelope::error(format!("Unknown message type: {}", kind))),
        Inbound::Malformed => Some(Envelope::error("Invalid message format")),
    }
}

/// `GET /ws?client_id=` upgrade
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.client_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, client_id: Option<String>) {
    let (sink, mut stream) = socket.split();
    let transport = WsTransport::new(sink);

    let subscription = match state.hub.subscribe(transport, client_id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting WebSocket client");
            return;
        }
    };

    let id = subscription.id.clone();
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(client_id = %id, error = %e, "WebSocket read failed");
                break;
            }
        };

        let answered = match reply_for(parse_inbound(&text)) {
            Some(reply) => state.hub.send_to(&subscription, reply).await,
            None => state.hub.heartbeat_from(&subscription).await,
        };
        match answered {
            Ok(true) => {}
            // Removed, or replaced by a newer connection with the same id
            Ok(false) | Err(_) => break,
        }
    }

    state.hub.unsubscribe(&subscription).await.ok();
    tracing::info!(client_id = %id, "WebSocket client disconnected");
}
