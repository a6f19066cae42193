use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use rentflow_core::{ItemId, LocationId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:item_id/:location_id", get(get_stock_level))
        .route("/:item_id/:location_id/verify", get(verify_stock))
}

fn parse_pool(item_id: &str, location_id: &str) -> Result<(ItemId, LocationId), axum::response::Response> {
    Ok((dto::parse_id(item_id)?, dto::parse_id(location_id)?))
}

pub async fn get_stock_level(
    Extension(services): Extension<Arc<AppServices>>,
    Path((item_id, location_id)): Path<(String, String)>,
) -> axum::response::Response {
    let (item_id, location_id) = match parse_pool(&item_id, &location_id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().stock_level(item_id, location_id) {
        Ok(level) => (StatusCode::OK, Json(level)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

/// Recount the pool from its units; 500 if the counters drifted.
pub async fn verify_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Path((item_id, location_id)): Path<(String, String)>,
) -> axum::response::Response {
    let (item_id, location_id) = match parse_pool(&item_id, &location_id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().verify_stock(item_id, location_id) {
        Ok(level) => (StatusCode::OK, Json(level)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
