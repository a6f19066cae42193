use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{Value as JsonValue, json};

use rentflow_core::DomainError;
use rentflow_infra::EngineError;

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    let status = status_for(&err);
    let details = err
        .domain()
        .and_then(|e| serde_json::to_value(e).ok())
        .and_then(|v| v.get("detail").cloned())
        .unwrap_or(JsonValue::Null);
    json_error_with_details(status, err.code(), err.to_string(), details)
}

fn status_for(err: &EngineError) -> StatusCode {
    let Some(domain) = err.domain() else {
        return if err.is_retryable() {
            StatusCode::CONFLICT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
    };
    match domain {
        DomainError::Validation(_) | DomainError::InvalidId(_) => StatusCode::BAD_REQUEST,
        DomainError::NotFound(_) => StatusCode::NOT_FOUND,
        DomainError::Conflict(_)
        | DomainError::InsufficientStock { .. }
        | DomainError::DuplicateIdempotencyKey { .. }
        | DomainError::StaleUnitVersion { .. }
        | DomainError::InvalidUnitTransition { .. } => StatusCode::CONFLICT,
        DomainError::InvalidLineTransition { .. }
        | DomainError::OverReturn { .. }
        | DomainError::Overpayment { .. }
        | DomainError::RefundRequired { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DomainError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    json_error_with_details(status, code, message, JsonValue::Null)
}

pub fn json_error_with_details(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    details: JsonValue,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
            "details": details,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentflow_core::{ItemId, LineId, LocationId};

    #[test]
    fn business_rejections_map_to_client_statuses() {
        let stock: EngineError = DomainError::InsufficientStock {
            item_id: ItemId::new(),
            location_id: LocationId::new(),
            requested: 3,
            available: 1,
        }
        .into();
        assert_eq!(status_for(&stock), StatusCode::CONFLICT);

        let over: EngineError = DomainError::OverReturn {
            line_id: LineId::new(),
            requested: 2,
            outstanding: 1,
        }
        .into();
        assert_eq!(status_for(&over), StatusCode::UNPROCESSABLE_ENTITY);

        let missing: EngineError = DomainError::not_found("line").into();
        assert_eq!(status_for(&missing), StatusCode::NOT_FOUND);

        let broken: EngineError = DomainError::invariant("ledger mismatch").into();
        assert_eq!(status_for(&broken), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(
            status_for(&EngineError::LockPoisoned("pool")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
