use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::BroadcastFrame;
use crate::registry::SessionRegistry;

/// Redis channel shared by all instances of the service
const FANOUT_CHANNEL: &str = "nexus-collab:fanout";

/// Capacity of the local relay channel feeding `run_relay`
const RELAY_CAPACITY: usize = 256;

/// Number of recently seen event ids kept for duplicate suppression
const DEDUPE_WINDOW: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("fanout bus unavailable: {0}")]
    Unavailable(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// One event as it travels between instances.
///
/// `event_id` is unique per broadcast; the relay drops frames it has already
/// seen, so at-least-once bus delivery still reaches each session exactly once.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FanoutFrame {
    pub event_id: String,
    pub origin: String,
    pub room_id: String,
    pub broadcast: BroadcastFrame,
}

/// Cross-instance pub/sub relay.
///
/// The bus is an injected dependency owned by the process entrypoint. Callers
/// see the same interface whether a shared Redis channel is configured
/// ([`RedisFanout`]) or the deployment is single-instance ([`LocalFanout`]).
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Identifier of this process instance, used for origin dedupe
    fn instance_id(&self) -> &str;

    /// Publish a room broadcast for peer instances to relay
    async fn publish(&self, frame: FanoutFrame) -> Result<(), FanoutError>;

    /// Subscribe to frames arriving from the shared channel
    fn frames(&self) -> broadcast::Receiver<FanoutFrame>;
}

/// No-op relay used when no shared channel is configured.
/// Publishes go nowhere and no frames ever arrive; local broadcast still works.
pub struct LocalFanout {
    instance_id: String,
    // Held so that subscribers stay open instead of seeing a closed channel
    relay_tx: broadcast::Sender<FanoutFrame>,
}

impl LocalFanout {
    pub fn new() -> Self {
        let (relay_tx, _rx) = broadcast::channel(RELAY_CAPACITY);
        Self {
            instance_id: Uuid::new_v4().to_string(),
            relay_tx,
        }
    }
}

impl Default for LocalFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutBus for LocalFanout {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, _frame: FanoutFrame) -> Result<(), FanoutError> {
        Ok(())
    }

    fn frames(&self) -> broadcast::Receiver<FanoutFrame> {
        self.relay_tx.subscribe()
    }
}

/// Fanout bus backed by a shared Redis pub/sub channel.
pub struct RedisFanout {
    instance_id: String,
    publish_conn: redis::aio::MultiplexedConnection,
    relay_tx: broadcast::Sender<FanoutFrame>,
}

impl RedisFanout {
    /// Connect to Redis and start the subscriber task.
    /// Fails if the connection cannot be established; callers are expected to
    /// fall back to [`LocalFanout`] with a warning.
    pub async fn connect(redis_url: &str) -> Result<Self, FanoutError> {
        let client = redis::Client::open(redis_url)?;
        let publish_conn = client.get_multiplexed_tokio_connection().await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(FANOUT_CHANNEL).await?;

        let (relay_tx, _rx) = broadcast::channel(RELAY_CAPACITY);
        let relay_tx2 = relay_tx.clone();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Failed to read fanout payload: {}", e);
                        continue;
                    }
                };
                let frame: FanoutFrame = match serde_json::from_str(&payload) {
                    Ok(f) => f,
                    Err(e) => {
                        error!("Failed to decode fanout frame: {}", e);
                        continue;
                    }
                };
                // Receivers lagging or absent is not an error here
                let _ = relay_tx2.send(frame);
            }
            warn!("Fanout subscriber stream ended; cross-instance relay stopped");
        });

        info!("Connected to Redis fanout channel '{}'", FANOUT_CHANNEL);
        Ok(Self {
            instance_id: Uuid::new_v4().to_string(),
            publish_conn,
            relay_tx,
        })
    }
}

#[async_trait]
impl FanoutBus for RedisFanout {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, frame: FanoutFrame) -> Result<(), FanoutError> {
        let payload = serde_json::to_string(&frame)
            .map_err(|e| FanoutError::Unavailable(format!("encode: {}", e)))?;
        let mut conn = self.publish_conn.clone();
        conn.publish::<_, _, ()>(FANOUT_CHANNEL, payload).await?;
        Ok(())
    }

    fn frames(&self) -> broadcast::Receiver<FanoutFrame> {
        self.relay_tx.subscribe()
    }
}

/// Relay loop: deliver frames from peer instances to local sessions.
///
/// Frames originated by this instance were already delivered locally at
/// publish time and are skipped. A bounded window of event ids suppresses
/// bus redelivery, so each session sees every event exactly once.
pub async fn run_relay(registry: Arc<SessionRegistry>, bus: Arc<dyn FanoutBus>) {
    let mut frames = bus.frames();
    let mut seen: HashSet<String> = HashSet::new();
    let mut seen_order: VecDeque<String> = VecDeque::new();

    loop {
        match frames.recv().await {
            Ok(frame) => {
                if frame.origin == bus.instance_id() {
                    continue;
                }
                if !seen.insert(frame.event_id.clone()) {
                    continue;
                }
                seen_order.push_back(frame.event_id.clone());
                if seen_order.len() > DEDUPE_WINDOW {
                    if let Some(old) = seen_order.pop_front() {
                        seen.remove(&old);
                    }
                }
                registry
                    .broadcast_local(&frame.room_id, frame.broadcast)
                    .await;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Fanout relay lagged, dropped {} frames", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
