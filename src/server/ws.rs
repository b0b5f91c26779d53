//! Push channel
//!
//! Clients connect, join rooms by chat fingerprint, and receive the events
//! the coordinator mirrors into those rooms. A connection may sit in many
//! rooms at once; everything it joined is cleaned up on disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::state::OrchestratorState;

/// `GET /ws`
pub async fn ws_handler(
    State(state): State<Arc<OrchestratorState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_connection(state, socket))
}

async fn handle_connection(state: Arc<OrchestratorState>, socket: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Writer task: room events plus direct replies share one ordered lane.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    debug!(target: "server", conn = %conn_id, "push channel connected");

    while let Some(frame) = source.next().await {
        let Ok(message) = frame else {
            break;
        };
        let Message::Text(text) = message else {
            // Pings are answered by axum; binary frames are not part of
            // the protocol.
            continue;
        };
        let Ok(request) = serde_json::from_str::<Value>(&text) else {
            let _ = tx.send(
                json!({ "type": "error", "error_code": "VALIDATION", "content": "invalid JSON" })
                    .to_string(),
            );
            continue;
        };
        handle_request(&state, &conn_id, &tx, &request);
    }

    state.rooms.leave_all(&conn_id);
    writer.abort();
    debug!(target: "server", conn = %conn_id, "push channel disconnected");
}

fn handle_request(
    state: &Arc<OrchestratorState>,
    conn_id: &str,
    tx: &mpsc::UnboundedSender<String>,
    request: &Value,
) {
    let action = request.get("action").and_then(Value::as_str).unwrap_or("");
    let room = request.get("room").and_then(Value::as_str).unwrap_or("");

    match action {
        "join" if !room.is_empty() => {
            state.rooms.join(room, conn_id, tx.clone());
            let _ = tx.send(json!({ "type": "joined", "room": room }).to_string());
        }
        "leave" if !room.is_empty() => {
            state.rooms.leave(room, conn_id);
            let _ = tx.send(json!({ "type": "left", "room": room }).to_string());
        }
        "ping" => {
            let _ = tx.send(json!({ "type": "pong" }).to_string());
        }
        _ => {
            let _ = tx.send(
                json!({
                    "type": "error",
                    "error_code": "VALIDATION",
                    "content": "expected {action: join|leave|ping, room}",
                })
                .to_string(),
            );
        }
    }
}
