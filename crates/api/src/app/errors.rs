use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use flagsched_infra::schedules::RunError;

/// Top-level error for a run that could not claim its batch.
pub const RUN_FAILED: &str = "Cron job failed";

pub fn run_error_to_response(err: RunError) -> axum::response::Response {
    match err {
        RunError::Claim(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, RUN_FAILED, e.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
