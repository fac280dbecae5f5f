use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::models::{Identity, PresenceEntry};

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    /// Binary CRDT delta, base64 on the wire
    #[serde_as(as = "Base64")]
    pub delta: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub identity: Identity,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub text: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    /// Full document snapshot, sufficient to reconstruct current state
    #[serde_as(as = "Base64")]
    pub snapshot: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RosterMessage {
    pub roster: Vec<PresenceEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub text: String,
    pub sender: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionBroadcast {
    pub output: String,
    pub timed_out: bool,
    pub crashed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

/// Messages received from a client over the room websocket
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ReceivedMessage {
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "presence")]
    Presence(PresenceMessage),
    #[serde(rename = "chat")]
    Chat(ChatMessage),
    #[serde(rename = "ping")]
    Ping(PingMessage),
}

/// Messages sent to clients over the room websocket
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum SendMessage {
    #[serde(rename = "init")]
    Init(InitMessage),
    #[serde(rename = "document-update")]
    DocumentUpdate(UpdateMessage),
    #[serde(rename = "presence-change")]
    PresenceChange(RosterMessage),
    #[serde(rename = "chat-message")]
    ChatMessage(ChatBroadcast),
    #[serde(rename = "execution-result")]
    ExecutionResult(ExecutionBroadcast),
    #[serde(rename = "pong")]
    Pong(PongMessage),
}

/// A message fanned out to every session in a room.
///
/// `exclude` carries the connection id the frame must not be delivered to
/// (usually the originator of a document update). Connection ids are globally
/// unique, so frames relayed from peer instances keep their exclusion intact.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BroadcastFrame {
    pub exclude: Option<String>,
    pub message: SendMessage,
}
