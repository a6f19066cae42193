use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use rentflow_core::{ItemId, LocationId, UnitId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(onboard_unit))
        .route("/:id", get(get_unit))
        .route("/:id/movements", get(get_unit_movements))
        .route("/:id/maintenance", post(send_to_maintenance))
        .route("/:id/repair", post(complete_repair))
        .route("/:id/retire", post(retire_unit))
}

pub async fn onboard_unit(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::OnboardUnitRequest>,
) -> axum::response::Response {
    let unit_id = match body.unit_id.as_deref().map(dto::parse_unit_id).transpose() {
        Ok(v) => v.unwrap_or_else(UnitId::new),
        Err(res) => return res,
    };
    let item_id = match dto::parse_id::<ItemId>(&body.item_id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let location_id = match dto::parse_id::<LocationId>(&body.location_id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.engine().onboard_unit(unit_id, item_id, location_id) {
        Ok(movement) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "unit_id": unit_id.to_string(),
                "movement": movement,
            })),
        )
            .into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_unit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let unit_id = match dto::parse_unit_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().unit(unit_id) {
        Ok(unit) => (StatusCode::OK, Json(unit)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_unit_movements(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let unit_id = match dto::parse_unit_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().movements_for_unit(unit_id) {
        Ok(movements) => (StatusCode::OK, Json(movements)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn send_to_maintenance(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match dto::parse_unit_id(&id) {
        Ok(unit_id) => movement_response(services.engine().send_to_maintenance(unit_id)),
        Err(res) => res,
    }
}

pub async fn complete_repair(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match dto::parse_unit_id(&id) {
        Ok(unit_id) => movement_response(services.engine().complete_repair(unit_id)),
        Err(res) => res,
    }
}

pub async fn retire_unit(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match dto::parse_unit_id(&id) {
        Ok(unit_id) => movement_response(services.engine().retire_unit(unit_id)),
        Err(res) => res,
    }
}

fn movement_response(
    result: rentflow_infra::EngineResult<rentflow_inventory::StockMovement>,
) -> axum::response::Response {
    match result {
        Ok(movement) => (StatusCode::OK, Json(movement)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
