use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request to run a code snippet in an isolated sandbox
#[derive(Serialize, Deserialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Language key in the runtime registry (javascript, python, cpp, java, ...)
    pub language: String,
    pub code: String,
    /// When set, the result is also broadcast to the room as `execution-result`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

/// Captured outcome of one execution job.
///
/// Timeouts and non-zero exits are ordinary results here, not faults.
#[derive(Serialize, Deserialize, Debug, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    /// Combined stdout/stderr, truncated at the configured byte ceiling
    pub output: String,
    pub timed_out: bool,
    pub crashed: bool,
}
