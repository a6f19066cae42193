use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use rentflow_core::LineId;
use rentflow_rental::{ExtraCharge, ReturnRequest};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/overdue", get(get_overdue_lines))
        .route("/:id", get(get_line))
        .route("/:id/activate", post(activate_line))
        .route("/:id/cancel", post(cancel_line))
        .route("/:id/returns", post(process_return).get(get_return_events))
        .route("/:id/charges", post(add_extra_charge))
        .route("/:id/settlement", get(get_settlement))
        .route("/:id/lifecycle", get(get_lifecycle))
}

pub async fn get_line(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let line_id = match dto::parse_id::<LineId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().line(line_id) {
        Ok(line) => (StatusCode::OK, Json(line)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn activate_line(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::AsOfBody>>,
) -> axum::response::Response {
    let line_id = match dto::parse_id::<LineId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let as_of = body.map(|Json(b)| b.date()).unwrap_or_else(dto::today);
    match services.engine().activate_rental(line_id, as_of) {
        Ok(lifecycle) => (StatusCode::OK, Json(lifecycle)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn cancel_line(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::AsOfBody>>,
) -> axum::response::Response {
    let line_id = match dto::parse_id::<LineId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let as_of = body.map(|Json(b)| b.date()).unwrap_or_else(dto::today);
    match services.engine().cancel_booking(line_id, as_of) {
        Ok(lifecycle) => (StatusCode::OK, Json(lifecycle)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn process_return(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::ProcessReturnRequest>,
) -> axum::response::Response {
    let line_id = match dto::parse_id::<LineId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let request = ReturnRequest {
        line_id,
        idempotency_key: body.idempotency_key,
        return_date: body.return_date,
        inspector: body.inspector,
        units: body.units,
        extra_charges: body.extra_charges,
    };

    let outcome = match services.engine().process_return(&request) {
        Ok(o) => o,
        Err(e) => return errors::engine_error_to_response(e),
    };
    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (
        status,
        Json(serde_json::json!({
            "return": outcome.rental_return,
            "event": outcome.event,
            "line_status": outcome.line_status,
            "movements": outcome.movements,
            "log_position": outcome.log_position,
            "replayed": outcome.replayed,
        })),
    )
        .into_response()
}

pub async fn get_return_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let line_id = match dto::parse_id::<LineId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().return_events_for_line(line_id) {
        Ok(events) => (StatusCode::OK, Json(events)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn add_extra_charge(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::AddExtraChargeRequest>,
) -> axum::response::Response {
    let line_id = match dto::parse_id::<LineId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let as_of = body.as_of.unwrap_or_else(dto::today);
    let charge = ExtraCharge {
        description: body.description,
        amount: body.amount,
    };
    match services.engine().add_extra_charge(line_id, charge, as_of) {
        Ok(settlement) => (StatusCode::OK, Json(settlement)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_settlement(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::AsOfQuery>,
) -> axum::response::Response {
    let line_id = match dto::parse_id::<LineId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().get_settlement(line_id, query.date()) {
        Ok(settlement) => (StatusCode::OK, Json(settlement)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_lifecycle(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::AsOfQuery>,
) -> axum::response::Response {
    let line_id = match dto::parse_id::<LineId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().get_lifecycle(line_id, query.date()) {
        Ok(lifecycle) => (StatusCode::OK, Json(lifecycle)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_overdue_lines(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::AsOfQuery>,
) -> axum::response::Response {
    match services.engine().overdue_lines(query.date()) {
        Ok(lines) => (StatusCode::OK, Json(lines)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
