//! WebSocket transport.
//!
//! One text frame carries one JSON event in each direction. Each
//! connection gets a bounded outbound channel; a pump task drains it to
//! the socket so no component ever blocks on a slow client. When the
//! channel fills, events are dropped for that client alone.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatterbox_core::{ClientEvent, ErrorKind, ServerEvent};

use crate::server::AppState;

/// Per-connection outbound queue depth. Sized for bursts of roster and
/// history traffic; a client that cannot keep up loses events rather
/// than stalling the server.
const OUTBOUND_BUFFER: usize = 256;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(websocket_handler))
}

/// GET /ws
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    info!(connection_id = %connection_id, "WebSocket connection established");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ServerEvent>(OUTBOUND_BUFFER);

    // Drain the outbound channel to the socket.
    let pump = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to serialize outbound event, skipping");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => {
                    state
                        .coordinator
                        .handle_event(connection_id, &tx, event)
                        .await;
                }
                Err(e) => {
                    debug!(connection_id = %connection_id, error = %e, "Malformed client event");
                    let _ = tx.try_send(ServerEvent::OperationError {
                        kind: ErrorKind::Validation,
                        message: format!("malformed event: {}", e),
                    });
                }
            },
            Ok(Message::Binary(_)) => {
                warn!(connection_id = %connection_id, "Binary frames are not supported");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // axum answers pings automatically.
            }
            Ok(Message::Close(_)) => {
                debug!(connection_id = %connection_id, "Close frame received");
                break;
            }
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    // Unregister before stopping the pump so departure notifications to
    // other clients are not raced by this connection's teardown.
    state.coordinator.handle_disconnect(connection_id).await;
    pump.abort();
    info!(connection_id = %connection_id, "WebSocket connection closed");
}
