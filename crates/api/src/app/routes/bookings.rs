use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_booking))
        .route("/activate-due", post(activate_due))
}

pub async fn create_booking(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateBookingRequest>,
) -> axum::response::Response {
    let request = match body.into_booking() {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.engine().create_booking(request) {
        Ok(outcome) => {
            let status = if outcome.replayed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(outcome)).into_response()
        }
        Err(e) => errors::engine_error_to_response(e),
    }
}

/// Activate every BOOKED line whose start date has arrived.
pub async fn activate_due(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<dto::AsOfBody>>,
) -> axum::response::Response {
    let as_of = body.map(|Json(b)| b.date()).unwrap_or_else(dto::today);
    match services.engine().activate_due(as_of) {
        Ok(activated) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "as_of": as_of,
                "activated": activated,
            })),
        )
            .into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
