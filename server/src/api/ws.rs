use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use super::AppState;
use crate::hub::UpdateListener;
use crate::model::{Device, Event, Position};

/// GET /api/ws?user_id=N — WebSocket endpoint for live updates.
///
/// The caller's identity is established upstream (reverse proxy / session
/// layer); this endpoint binds the socket to the given user id and delivers
/// whatever the permissions oracle lets that user see.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub user_id: i64,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_user_ws(socket, query.user_id, state))
}

/// Hub listener that forwards every update as a JSON frame. Delivery into
/// the channel never blocks; frames for a closed socket are dropped.
struct WsListener {
    tx: mpsc::UnboundedSender<serde_json::Value>,
}

impl UpdateListener for WsListener {
    fn on_keepalive(&self) {
        let _ = self.tx.send(json!({"event": "keepalive"}));
    }

    fn on_update_device(&self, device: &Device) {
        let _ = self.tx.send(json!({"event": "device", "data": device}));
    }

    fn on_update_position(&self, position: &Position) {
        let _ = self.tx.send(json!({"event": "position", "data": position}));
    }

    fn on_update_event(&self, event: &Event) {
        let _ = self.tx.send(json!({"event": "event", "data": event}));
    }
}

/// Pump hub updates out to the user's socket until either side closes.
async fn handle_user_ws(mut socket: WebSocket, user_id: i64, state: AppState) {
    info!(user_id, "User WebSocket connection opened");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn UpdateListener> = Arc::new(WsListener { tx });
    state.hub.add_listener(user_id, &listener);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    // The listener is deregistered outside any callback, never from within
    // one, so the registry lock is free to take here.
    state.hub.remove_listener(user_id, &listener);
    info!(user_id, "User WebSocket connection closed");
}
