use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{Identity, InitMessage, ReceivedMessage, SendMessage};
use crate::state::AppState;
use crate::websocket::msg_chat_handler::handle_chat_message;
use crate::websocket::msg_ping_handler::handle_ping_message;
use crate::websocket::msg_presence_handler::handle_presence_message;
use crate::websocket::msg_update_handler::handle_update_message;

/// Identity attached by the transport gateway as query parameters
#[derive(Deserialize)]
pub struct IdentityQuery {
    name: Option<String>,
    color: Option<String>,
    avatar: Option<String>,
}

impl IdentityQuery {
    fn into_identity(self) -> Identity {
        Identity {
            name: self.name.unwrap_or_else(|| "anonymous".to_string()),
            color: self.color.unwrap_or_else(|| "#888888".to_string()),
            avatar: self.avatar,
        }
    }
}

/// WebSocket handler
pub async fn websocket_handler(
    Path(room_id): Path<String>,
    Query(query): Query<IdentityQuery>,
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    info!("New WebSocket connection attempt for room {}", room_id);
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, query.into_identity(), app_state))
}

/// Purge a session and tell the room; the last one out triggers
/// flush-and-evict of the document. Every exit path of the connection goes
/// through here, the failed-setup ones included, so a loaded document never
/// stays resident without sessions.
async fn depart(app_state: &Arc<AppState>, room_id: &str, conn_id: &str) {
    let last_left = app_state.registry.leave(room_id, conn_id).await;
    app_state.presence.announce(room_id).await;
    if last_left {
        app_state.sync.flush_and_evict(room_id).await;
    }
}

/// Handle WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    room_id: String,
    identity: Identity,
    app_state: Arc<AppState>,
) {
    // Generate unique connection ID to identify this client
    let conn_id = Uuid::new_v4().to_string();

    info!(
        "WebSocket connection established for room {} with connection {}",
        room_id, conn_id
    );

    // Join the room first so no broadcast between snapshot and subscription
    // is missed.
    let mut frames = app_state
        .registry
        .join(&room_id, &conn_id, identity)
        .await;

    // Materialize the document and send the full snapshot to the client
    let snapshot = match app_state.sync.on_join(&room_id).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Failed to load document for room {}: {}", room_id, e);
            depart(&app_state, &room_id, &conn_id).await;
            return;
        }
    };

    // Split the socket into sender and receiver
    let (sender, mut receiver) = socket.split();

    // The sender is shared between the inbound loop (pong replies) and the
    // broadcast forwarding task
    let sender1 = Arc::new(Mutex::new(sender));
    let sender2 = sender1.clone();

    let init_msg = SendMessage::Init(InitMessage { snapshot });
    let init_text = match serde_json::to_string(&init_msg) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode init message for room {}: {}", room_id, e);
            depart(&app_state, &room_id, &conn_id).await;
            return;
        }
    };
    if sender1
        .lock()
        .await
        .send(Message::Text(init_text))
        .await
        .is_err()
    {
        error!("Failed to send init message for room {}", room_id);
        depart(&app_state, &room_id, &conn_id).await;
        return;
    }

    // Everyone, the new session included, gets the updated roster
    app_state.presence.announce(&room_id).await;

    // Inbound task: parse client messages and dispatch
    let state1 = app_state.clone();
    let room1 = room_id.clone();
    let conn1 = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(Ok(Message::Text(msg))) = receiver.next().await {
            // Parse the incoming message as JSON
            let json_msg: ReceivedMessage = match serde_json::from_str(&msg) {
                Ok(json_msg) => json_msg,
                Err(e) => {
                    error!("Failed to parse message for room {}: {}", room1, e);
                    continue;
                }
            };

            // Handle different message types
            match json_msg {
                ReceivedMessage::Update(update_msg) => {
                    handle_update_message(&update_msg, &room1, &conn1, &state1).await;
                }
                ReceivedMessage::Presence(presence_msg) => {
                    handle_presence_message(&presence_msg, &room1, &conn1, &state1).await;
                }
                ReceivedMessage::Chat(chat_msg) => {
                    handle_chat_message(&chat_msg, &room1, &conn1, &state1).await;
                }
                ReceivedMessage::Ping(ping_msg) => {
                    handle_ping_message(&ping_msg, &room1, &sender1).await;
                }
            }
        }
    });

    // Outbound task: forward room broadcasts to this client
    let conn2 = conn_id.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    // Skip frames addressed away from this connection
                    if frame.exclude.as_deref() == Some(conn2.as_str()) {
                        continue;
                    }
                    let text = match serde_json::to_string(&frame.message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode broadcast frame: {}", e);
                            continue;
                        }
                    };
                    if sender2.lock().await.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    error!("Connection {} lagged, dropped {} frames", conn2, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    // Disconnect detected by the transport
    depart(&app_state, &room_id, &conn_id).await;
    info!("WebSocket connection terminated for room {}", room_id);
}
