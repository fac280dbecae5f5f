use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::{error, info};

use crate::exec::ExecError;
use crate::models::{
    ErrorResponse, ExecuteRequest, ExecuteResponse, ExecutionBroadcast, SendMessage,
};
use crate::state::AppState;

/// Execute a code snippet in an isolated sandbox
pub async fn execute(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecuteResponse>), (StatusCode, Json<ErrorResponse>)> {
    info!("Execute request for language '{}'", request.language);

    let result = match app_state.exec.submit(&request.language, &request.code).await {
        Ok(result) => result,
        Err(ExecError::UnsupportedLanguage(lang)) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    code: StatusCode::BAD_REQUEST.as_u16(),
                    status: "error".to_string(),
                    error: format!("Unsupported language '{}'", lang),
                }),
            ));
        }
        Err(e) => {
            error!("Execution failed: {}", e);
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    status: "error".to_string(),
                    error: "Execution failed".to_string(),
                }),
            ));
        }
    };

    // Room-scoped runs share the result with every session in the room
    if let Some(room_id) = &request.room_id {
        app_state
            .registry
            .broadcast(
                room_id,
                SendMessage::ExecutionResult(ExecutionBroadcast {
                    output: result.output.clone(),
                    timed_out: result.timed_out,
                    crashed: result.crashed,
                }),
                None,
            )
            .await;
    }

    Ok((
        StatusCode::OK,
        Json(ExecuteResponse {
            output: result.output,
            timed_out: result.timed_out,
            crashed: result.crashed,
        }),
    ))
}
