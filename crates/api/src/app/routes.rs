use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::errors::run_error_to_response;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Run one invocation of the job. Individual schedule failures are reported
/// in the body; only a failed claim is an error response.
pub async fn process_flag_schedules(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.runner.run().await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => run_error_to_response(err),
    }
}
