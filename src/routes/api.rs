use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{diagnostics, execute, health_check, ready_check};
use crate::state::AppState;

/// Create API routes
pub fn create_api_routes(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health_check))
        .route("/v1/ready", get(ready_check))
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/execute", post(execute))
        .with_state(app_state)
}
