//! A simple health check endpoint.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tablesink_system::Controller;

#[derive(Serialize)]
struct Status {
    is_healthy: bool,
}

/// Reports the server as healthy until a shutdown has been initiated.
pub async fn handle() -> impl IntoResponse {
    if Controller::shutdown_handle().get().is_none() {
        (StatusCode::OK, axum::Json(Status { is_healthy: true }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(Status { is_healthy: false }),
        )
    }
}
