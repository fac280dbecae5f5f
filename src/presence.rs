use std::sync::Arc;

use tracing::debug;

use crate::models::{RosterMessage, SendMessage};
use crate::registry::SessionRegistry;

/// Broadcasts the per-room presence roster.
///
/// Every join, leave or identity change rebroadcasts the full roster to the
/// whole room, originator included. Full-roster rebroadcast keeps every
/// client's view convergent under duplicate fanout delivery, since the state
/// is derived from the event content rather than accumulated from deltas.
pub struct PresenceBroadcaster {
    registry: Arc<SessionRegistry>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Recompute the room's roster and broadcast it to every session.
    pub async fn announce(&self, room_id: &str) {
        let roster = self.registry.roster(room_id).await;
        debug!("Presence roster for room {}: {} entries", room_id, roster.len());
        self.registry
            .broadcast(
                room_id,
                SendMessage::PresenceChange(RosterMessage { roster }),
                None,
            )
            .await;
    }
}
