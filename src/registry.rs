use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fanout::{FanoutBus, FanoutFrame};
use crate::models::{BroadcastFrame, Identity, PresenceEntry, SendMessage};

/// Capacity of one room's local broadcast channel
const ROOM_CHANNEL_CAPACITY: usize = 100;

struct Room {
    channel: broadcast::Sender<BroadcastFrame>,
    sessions: HashMap<String, Identity>,
}

impl Room {
    fn new() -> Self {
        let (channel, _rx) = broadcast::channel(ROOM_CHANNEL_CAPACITY);
        Self {
            channel,
            sessions: HashMap::new(),
        }
    }
}

/// Tracks which connections belong to which document room.
///
/// Each room carries a broadcast channel every local session subscribes to;
/// broadcasts additionally go out on the fanout bus so sessions connected to
/// peer instances receive them too.
pub struct SessionRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    fanout: Arc<dyn FanoutBus>,
}

impl SessionRegistry {
    pub fn new(fanout: Arc<dyn FanoutBus>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            fanout,
        }
    }

    /// Add a connection to a room. Idempotent: re-joining refreshes the
    /// identity and hands back a fresh receiver.
    pub async fn join(
        &self,
        room_id: &str,
        conn_id: &str,
        identity: Identity,
    ) -> broadcast::Receiver<BroadcastFrame> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(room_id.to_string()).or_insert_with(Room::new);
        room.sessions.insert(conn_id.to_string(), identity);
        info!(
            "Connection {} joined room {} ({} sessions)",
            conn_id,
            room_id,
            room.sessions.len()
        );
        room.channel.subscribe()
    }

    /// Remove a connection from a room. Safe no-op if not present.
    /// Returns true when the last session left and the room was dropped,
    /// which signals the sync engine to flush-and-evict the document.
    pub async fn leave(&self, room_id: &str, conn_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return false;
        };
        if room.sessions.remove(conn_id).is_none() {
            debug!("Leave for unknown connection {} in room {}", conn_id, room_id);
            return false;
        }
        info!(
            "Connection {} left room {} ({} sessions remain)",
            conn_id,
            room_id,
            room.sessions.len()
        );
        if room.sessions.is_empty() {
            rooms.remove(room_id);
            return true;
        }
        false
    }

    /// Replace the identity of a connection. Returns false if unknown.
    pub async fn update_identity(&self, room_id: &str, conn_id: &str, identity: Identity) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get_mut(room_id) {
            Some(room) if room.sessions.contains_key(conn_id) => {
                room.sessions.insert(conn_id.to_string(), identity);
                true
            }
            _ => false,
        }
    }

    /// Current identities in a room, ordered by connection id for stable output
    pub async fn roster(&self, room_id: &str) -> Vec<PresenceEntry> {
        let rooms = self.rooms.read().await;
        let mut roster: Vec<PresenceEntry> = rooms
            .get(room_id)
            .map(|room| {
                room.sessions
                    .iter()
                    .map(|(conn_id, identity)| PresenceEntry {
                        conn_id: conn_id.clone(),
                        identity: identity.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        roster.sort_by(|a, b| a.conn_id.cmp(&b.conn_id));
        roster
    }

    /// Deliver to all local sessions in the room and publish on the fanout
    /// bus so peer instances relay to theirs.
    pub async fn broadcast(&self, room_id: &str, message: SendMessage, exclude: Option<&str>) {
        let frame = BroadcastFrame {
            exclude: exclude.map(|c| c.to_string()),
            message,
        };
        self.broadcast_local(room_id, frame.clone()).await;

        let fanout_frame = FanoutFrame {
            event_id: Uuid::new_v4().to_string(),
            origin: self.fanout.instance_id().to_string(),
            room_id: room_id.to_string(),
            broadcast: frame,
        };
        if let Err(e) = self.fanout.publish(fanout_frame).await {
            // Single-instance correctness is preserved; only cross-instance
            // fanout is lost.
            warn!("Fanout publish failed, delivering locally only: {}", e);
        }
    }

    /// Deliver to local sessions only. Used by the relay for frames arriving
    /// from peer instances.
    pub async fn broadcast_local(&self, room_id: &str, frame: BroadcastFrame) {
        let rooms = self.rooms.read().await;
        if let Some(room) = rooms.get(room_id) {
            // Send errors just mean no active receivers
            let _ = room.channel.send(frame);
        }
    }

    /// (connections, rooms) counts for diagnostics
    pub async fn stats(&self) -> (u32, u32) {
        let rooms = self.rooms.read().await;
        let n_conn = rooms.values().map(|r| r.sessions.len() as u32).sum();
        (n_conn, rooms.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::tests::LoopbackFanout;
    use crate::fanout::{run_relay, LocalFanout};
    use crate::models::{ChatBroadcast, SendMessage};
    use std::time::Duration;
    use tokio::time::timeout;

    fn identity(name: &str) -> Identity {
        Identity {
            name: name.to_string(),
            color: "#ff0000".to_string(),
            avatar: None,
        }
    }

    fn chat(text: &str) -> SendMessage {
        SendMessage::ChatMessage(ChatBroadcast {
            text: text.to_string(),
            sender: "ann".to_string(),
        })
    }

    fn local_registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(Arc::new(LocalFanout::new())))
    }

    #[tokio::test]
    async fn last_leave_empties_the_room() {
        let registry = local_registry();
        registry.join("doc-1", "c1", identity("ann")).await;
        registry.join("doc-1", "c2", identity("bob")).await;

        assert!(!registry.leave("doc-1", "c1").await);
        assert!(registry.leave("doc-1", "c2").await);

        let (n_conn, n_rooms) = registry.stats().await;
        assert_eq!((n_conn, n_rooms), (0, 0));
    }

    #[tokio::test]
    async fn leave_unknown_connection_is_a_noop() {
        let registry = local_registry();
        registry.join("doc-1", "c1", identity("ann")).await;
        assert!(!registry.leave("doc-1", "nope").await);
        assert!(!registry.leave("other", "c1").await);
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let registry = local_registry();
        registry.join("doc-1", "c1", identity("ann")).await;
        registry.join("doc-1", "c1", identity("ann")).await;

        let roster = registry.roster("doc-1").await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].identity.name, "ann");
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribed_sessions() {
        let registry = local_registry();
        let mut rx1 = registry.join("doc-1", "c1", identity("ann")).await;
        let mut rx2 = registry.join("doc-1", "c2", identity("bob")).await;

        registry.broadcast("doc-1", chat("hello"), Some("c1")).await;

        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        // Both receive the frame; the connection task drops excluded frames
        assert_eq!(f1.exclude.as_deref(), Some("c1"));
        assert_eq!(f2.exclude.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn relay_delivers_cross_instance_exactly_once() {
        let (bus_a, bus_b) = LoopbackFanout::pair();
        let registry_a = Arc::new(SessionRegistry::new(bus_a.clone()));
        let registry_b = Arc::new(SessionRegistry::new(bus_b.clone()));

        tokio::spawn(run_relay(registry_a.clone(), bus_a.clone()));
        tokio::spawn(run_relay(registry_b.clone(), bus_b.clone()));
        // Let the relay tasks subscribe before anything is published
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut rx_a = registry_a.join("doc-1", "c-a", identity("ann")).await;
        let mut rx_b = registry_b.join("doc-1", "c-b", identity("bob")).await;

        registry_a.broadcast("doc-1", chat("hello"), None).await;

        // Session on the peer instance receives the event exactly once even
        // though the bus redelivered the frame.
        timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap().unwrap();
        assert!(timeout(Duration::from_millis(200), rx_b.recv()).await.is_err());

        // Originating instance delivered locally once; its own frames coming
        // back over the bus are dropped by origin dedupe.
        timeout(Duration::from_secs(1), rx_a.recv()).await.unwrap().unwrap();
        assert!(timeout(Duration::from_millis(200), rx_a.recv()).await.is_err());
    }
}
