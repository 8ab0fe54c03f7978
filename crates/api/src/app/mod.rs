//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store and collaborator wiring (Postgres or in-memory)
//! - `routes.rs`: HTTP handlers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};

pub mod errors;
pub mod routes;
pub mod services;

pub use services::{build_services, AppServices, InMemoryBackends};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/jobs/process-flag-schedules",
            post(routes::process_flag_schedules),
        )
        .layer(Extension(services))
}
