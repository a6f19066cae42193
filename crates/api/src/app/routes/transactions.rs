use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use rentflow_core::TransactionId;
use rentflow_infra::{EngineResult, PaymentOutcome};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/:id/payments", post(apply_payment))
        .route("/:id/refunds", post(apply_refund))
        .route("/:id/settlement", get(get_transaction_settlement))
        .route("/:id/movements", get(get_transaction_movements))
}

pub async fn apply_payment(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::PaymentRequest>,
) -> axum::response::Response {
    let transaction_id = match dto::parse_id::<TransactionId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let (input, as_of) = body.into_input();
    payment_response(services.engine().apply_payment(transaction_id, input, as_of))
}

pub async fn apply_refund(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::PaymentRequest>,
) -> axum::response::Response {
    let transaction_id = match dto::parse_id::<TransactionId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let (input, as_of) = body.into_input();
    payment_response(services.engine().apply_refund(transaction_id, input, as_of))
}

fn payment_response(result: EngineResult<PaymentOutcome>) -> axum::response::Response {
    match result {
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

pub async fn get_transaction_settlement(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::AsOfQuery>,
) -> axum::response::Response {
    let transaction_id = match dto::parse_id::<TransactionId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services
        .engine()
        .get_transaction_settlement(transaction_id, query.date())
    {
        Ok(settlement) => (StatusCode::OK, Json(settlement)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}

pub async fn get_transaction_movements(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let transaction_id = match dto::parse_id::<TransactionId>(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match services.engine().movements_for_transaction(transaction_id) {
        Ok(movements) => (StatusCode::OK, Json(movements)).into_response(),
        Err(e) => errors::engine_error_to_response(e),
    }
}
