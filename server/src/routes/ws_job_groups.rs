//! `WS /ws/job-groups/{id}`: live narration of one job group's children.
//!
//! On connect the client receives `GroupEvent::InitialState` built from a
//! snapshot taken at subscribe time, then every event the group manager
//! broadcasts afterwards. Client `"ping"` gets `{"type":"pong"}`; `"close"`
//! ends the session; anything else is echoed back as `{"type":"echo",...}`.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use orchestrator_core::group_manager::GroupEvent;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ws/job-groups/{id}", get(upgrade))
}

/// Close code used when the path names a job group that doesn't exist.
///
/// There's no `1011` (engine not initialized) case here: the group manager
/// and its registry are constructed before the listener ever binds, so by
/// the time a WebSocket upgrade can reach this handler the engine always is.
const CLOSE_UNKNOWN_GROUP: u16 = 1008;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>, Path(group_id): Path<String>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, group_id))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, group_id: String) {
    let (group, mut events) = match state.group_manager.register_websocket_handler(&group_id) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(group_id = %group_id, error = %e, "rejecting websocket subscription");
            let _ = socket
                .send(Message::Close(Some(CloseFrame { code: CLOSE_UNKNOWN_GROUP, reason: "job group not found".into() })))
                .await;
            return;
        }
    };

    if send_event(&mut socket, &GroupEvent::InitialState { group }).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(group_id = %group_id, skipped, "websocket subscriber lagged; events were dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let handled = match text.as_str() {
                            "ping" => send_json(&mut socket, &json!({ "type": "pong" })).await,
                            "close" => {
                                let _ = socket.send(Message::Close(None)).await;
                                break;
                            }
                            other => send_json(&mut socket, &json!({ "type": "echo", "received": other })).await,
                        };
                        if handled.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(group_id = %group_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.group_manager.unregister_websocket_handler(&group_id, events);
}

async fn send_event(socket: &mut WebSocket, event: &GroupEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text.into())).await
}

async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}
