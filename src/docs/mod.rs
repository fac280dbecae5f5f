use utoipa::OpenApi;

use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/ready",
    responses(
        (status = 200, description = "Service is ready", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Execute a code snippet in an isolated sandbox
#[utoipa::path(
    post,
    path = "/api/v1/execute",
    request_body = ExecuteRequest,
    responses(
        (status = 200, description = "Snippet executed; timeouts and crashes are ordinary results", body = ExecuteResponse),
        (status = 400, description = "Unsupported language", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn execute_doc() {}

/// Instance diagnostics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics snapshot", body = DiagnosticsResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        execute_doc,
        diagnostics_doc,
    ),
    components(
        schemas(HealthResponse, ExecuteRequest, ExecuteResponse, ErrorResponse, DiagnosticsResponse)
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
