//! Web server endpoints.

use axum::Router;
use axum::routing::get;
use tablesink_config::Config;

use crate::service::ServiceState;

mod health_check;
mod otlp;

/// All routes of the server.
pub fn routes(config: &Config) -> Router<ServiceState> {
    Router::new()
        .route("/api/health", get(health_check::handle))
        .route("/api/health/", get(health_check::handle))
        .route("/v1/metrics", otlp::route(config))
        .route("/v1/metrics/", otlp::route(config))
}
