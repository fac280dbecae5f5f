use serde::{Deserialize, Serialize};

/// Display identity attached to a connection by the transport gateway.
/// Never persisted; lives only as long as the connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub name: String,
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// One entry of a room's presence roster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub conn_id: String,
    #[serde(flatten)]
    pub identity: Identity,
}
