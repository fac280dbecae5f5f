use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::models::UpdateMessage;
use crate::state::AppState;
use crate::sync::SyncError;

/// Handle UpdateMessage
pub async fn handle_update_message(
    update_msg: &UpdateMessage,
    room_id: &str,
    conn_id: &str,
    state: &Arc<AppState>,
) {
    debug!(
        "Update message received for room {}: {} delta bytes",
        room_id,
        update_msg.delta.len()
    );

    // Merge, mark dirty and re-broadcast to the other sessions
    match state
        .sync
        .on_update(room_id, update_msg.delta.clone(), conn_id)
        .await
    {
        Ok(()) => {}
        Err(SyncError::UnknownDocument(_)) => {
            warn!("Update for unknown room {} from {}", room_id, conn_id);
        }
        Err(e) => {
            error!("Failed to apply update for room {}: {}", room_id, e);
        }
    }
}
