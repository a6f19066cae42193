//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: the engine instance and the realtime (SSE) bridge
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request DTOs and path/query parsing helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use rentflow_infra::EngineConfig;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(config: EngineConfig) -> Router {
    let services = Arc::new(services::build_services(config));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
