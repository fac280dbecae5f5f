use std::sync::Arc;

use tracing::{info, warn};

use crate::models::PresenceMessage;
use crate::state::AppState;

/// Handle PresenceMessage
pub async fn handle_presence_message(
    presence_msg: &PresenceMessage,
    room_id: &str,
    conn_id: &str,
    state: &Arc<AppState>,
) {
    info!(
        "Presence change for room {}: {} is now '{}'",
        room_id, conn_id, presence_msg.identity.name
    );

    let known = state
        .registry
        .update_identity(room_id, conn_id, presence_msg.identity.clone())
        .await;
    if !known {
        warn!("Presence change for unknown connection {} in room {}", conn_id, room_id);
        return;
    }

    // Full roster rebroadcast, originator included
    state.presence.announce(room_id).await;
}
