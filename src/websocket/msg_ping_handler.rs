use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::models::{PingMessage, PongMessage, SendMessage};

/// Handle PingMessage
pub async fn handle_ping_message(
    _ping_msg: &PingMessage,
    room_id: &str,
    sender: &Arc<Mutex<SplitSink<WebSocket, Message>>>,
) {
    debug!("Ping message received for room {}", room_id);

    // Reply with pong
    let pong = SendMessage::Pong(PongMessage {
        date: Utc::now().to_rfc3339(),
    });
    let pong_msg = match serde_json::to_string(&pong) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode pong message: {}", e);
            return;
        }
    };
    if sender.lock().await.send(Message::Text(pong_msg)).await.is_err() {
        error!("Failed to send pong message for room {}", room_id);
    }
}
