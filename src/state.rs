use std::sync::Arc;

use crate::exec::ExecOrchestrator;
use crate::presence::PresenceBroadcaster;
use crate::registry::SessionRegistry;
use crate::sync::SyncEngine;

/// Shared application state handed to every handler
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub sync: Arc<SyncEngine>,
    pub presence: PresenceBroadcaster,
    pub exec: ExecOrchestrator,
}
