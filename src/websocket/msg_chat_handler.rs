use std::sync::Arc;

use tracing::info;

use crate::models::{ChatBroadcast, ChatMessage, SendMessage};
use crate::state::AppState;

/// Handle ChatMessage
pub async fn handle_chat_message(
    chat_msg: &ChatMessage,
    room_id: &str,
    conn_id: &str,
    state: &Arc<AppState>,
) {
    // Resolve the sender's display name from the current roster
    let sender = state
        .registry
        .roster(room_id)
        .await
        .into_iter()
        .find(|entry| entry.conn_id == conn_id)
        .map(|entry| entry.identity.name)
        .unwrap_or_else(|| "anonymous".to_string());

    info!("Chat message in room {} from {}", room_id, sender);

    state
        .registry
        .broadcast(
            room_id,
            SendMessage::ChatMessage(ChatBroadcast {
                text: chat_msg.text.clone(),
                sender,
            }),
            Some(conn_id),
        )
        .await;
}
