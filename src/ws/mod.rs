//! WebSocket surface: upgrade handler wiring C9 (subscriptions), C10
//! (connections), C11 (codec) and C13 (heartbeat) together. C12 (the
//! publisher) runs as its own background task against the same
//! [`SubscriptionIndex`]/[`ConnectionManager`] pair (spec §4.12).
//!
//! The upgrade handler and its `tokio::select!` read/write loop are the
//! direct generalization of `main.rs::handle_socket`: same shape (upgrade
//! → per-connection task → select over outbound vs inbound), replacing
//! the single `broadcast::Sender<WsServerEvent>` with the addressable
//! [`ConnectionManager`] queue this gateway needs for per-subscriber
//! fan-out.

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod publisher;
pub mod subscription;

use crate::error::{AppError, ErrorRecord, Severity};
use crate::resilience::ErrorHandler;
use crate::telemetry::TelemetryCore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use codec::{parse_inbound, CompressionCache, InboundMessage, OutboundFrame};
use connection::ConnectionManager;
use heartbeat::HeartbeatSupervisor;
use std::sync::Arc;
use subscription::SubscriptionIndex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct WsState {
    pub subscriptions: Arc<SubscriptionIndex>,
    pub connections: Arc<ConnectionManager>,
    pub heartbeat: Arc<HeartbeatSupervisor>,
    pub error_handler: Arc<ErrorHandler>,
    pub telemetry: Arc<TelemetryCore>,
    pub max_subscriptions_per_client: usize,
}

/// Data types a client may subscribe to (spec §6 subscription payload).
const SUPPORTED_DATA_TYPES: &[&str] = &["quote", "kline", "trade", "depth", "tick", "orderbook"];

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsState) {
    let client_id = Uuid::new_v4().to_string();
    let mut outbound = state.connections.connect(client_id.clone());
    state.heartbeat.register(&client_id);
    debug!(client_id, "client connected");

    send_frame(
        &mut socket,
        &OutboundFrame::Welcome {
            client_id: client_id.clone(),
            supported_data_types: SUPPORTED_DATA_TYPES.to_vec(),
            heartbeat_interval_secs: state.heartbeat.ping_interval().as_secs(),
            max_subscriptions: state.max_subscriptions_per_client,
        },
    )
    .await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        // spec §4.12: any inbound frame counts as liveness,
                        // not just heartbeat/pong.
                        state.heartbeat.record_pong(&client_id);
                        if text.len() > codec::MAX_MESSAGE_SIZE_BYTES {
                            record_and_send_error(&state, &mut socket, &AppError::FrameTooLarge).await;
                        } else {
                            handle_inbound(&client_id, &text, &state, &mut socket).await;
                        }
                    }
                    Ok(Message::Pong(_)) => state.heartbeat.record_pong(&client_id),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(client_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.subscriptions.unsubscribe_all(&client_id);
    state.connections.disconnect(&client_id);
    state.heartbeat.forget(&client_id);
    debug!(client_id, "client disconnected");
}

async fn handle_inbound(client_id: &str, text: &str, state: &WsState, socket: &mut WebSocket) {
    let parsed = match parse_inbound(text) {
        Ok(m) => m,
        Err(e) => {
            send_error(socket, &e).await;
            return;
        }
    };

    match parsed {
        InboundMessage::Ping { timestamp } => {
            send_frame(socket, &OutboundFrame::Pong { timestamp }).await;
        }
        InboundMessage::Subscribe { key } => {
            if let Err(e) = state.subscriptions.subscribe(client_id, key) {
                record_and_send_error(state, socket, &e).await;
            }
        }
        InboundMessage::Unsubscribe { key } => {
            state.subscriptions.unsubscribe(client_id, &key);
        }
        InboundMessage::UnsubscribeAll => {
            state.subscriptions.unsubscribe_all(client_id);
        }
        InboundMessage::GetSubscriptions => {
            let frame = OutboundFrame::SubscriptionList {
                subscriptions: state.subscriptions.client_subscriptions(client_id),
            };
            send_frame(socket, &frame).await;
        }
        InboundMessage::Heartbeat { client_time } => {
            state.heartbeat.record_pong(client_id);
            let server_time = chrono::Utc::now().timestamp_millis();
            let rtt_ms = client_time.map(|sent| (server_time - sent).max(0));
            send_frame(socket, &OutboundFrame::Pong { timestamp: rtt_ms.unwrap_or(server_time) }).await;
        }
        InboundMessage::GetStatus => {
            let frame = OutboundFrame::Status {
                connections: state.connections.connection_count(),
                subscriptions: state.subscriptions.subscriber_count(),
            };
            send_frame(socket, &frame).await;
        }
        InboundMessage::GetStats => {
            let counters = state.telemetry.counters();
            send_frame(socket, &OutboundFrame::Stats { counters: serde_json::json!(counters) }).await;
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &OutboundFrame) {
    let Ok(json) = serde_json::to_vec(frame) else { return };
    let _ = socket.send(Message::Binary(json)).await;
}

async fn send_error(socket: &mut WebSocket, err: &AppError) {
    let record = ErrorRecord::new(err, Severity::Low);
    send_frame(socket, &OutboundFrame::Error(record)).await;
}

async fn record_and_send_error(state: &WsState, socket: &mut WebSocket, err: &AppError) {
    let (_, record) = state.error_handler.handle(err);
    state.telemetry.incr_error();
    send_frame(socket, &OutboundFrame::Error(record)).await;
}

/// Standalone helper reused by the HTTP `/ws/broadcast` admin route
/// (spec §6) to push an operator-authored message to a specific set of
/// clients outside the normal publish tick.
pub fn broadcast_raw(
    connections: &ConnectionManager,
    compression: &CompressionCache,
    client_ids: &[String],
    frame: &OutboundFrame,
) -> Result<usize, AppError> {
    let encoded = compression.encode(frame)?;
    let payload = Arc::new(encoded.bytes);
    Ok(connections.broadcast(client_ids, payload))
}

/// Same as [`broadcast_raw`], for the arbitrary `{type, data}` body
/// `POST /ws/broadcast` accepts (spec §6) rather than one of the fixed
/// [`OutboundFrame`] variants.
pub fn broadcast_custom(
    connections: &ConnectionManager,
    compression: &CompressionCache,
    client_ids: &[String],
    kind: &str,
    data: serde_json::Value,
) -> Result<usize, AppError> {
    let encoded = compression.encode_raw(kind, data)?;
    let payload = Arc::new(encoded.bytes);
    Ok(connections.broadcast(client_ids, payload))
}
