use axum::{Router, routing::get};

pub mod bookings;
pub mod lines;
pub mod stock;
pub mod system;
pub mod transactions;
pub mod units;

/// Router for all engine endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/stream", get(system::stream))
        .nest("/units", units::router())
        .nest("/stock", stock::router())
        .nest("/bookings", bookings::router())
        .nest("/lines", lines::router())
        .nest("/transactions", transactions::router())
}
