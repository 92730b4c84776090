use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{json, Value};

use stockhold_infra::StockError;

pub fn stock_error_to_response(err: StockError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        StockError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        StockError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        StockError::InsufficientStock { lines } => json_error_with(
            StatusCode::BAD_REQUEST,
            "insufficient_stock",
            message,
            json!({ "lines": lines }),
        ),
        StockError::ReservationNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "reservation_not_found", message)
        }
        StockError::ReservationExpired(_) => json_error(StatusCode::GONE, "reservation_expired", message),
        StockError::ReservationConflict { .. } => {
            json_error(StatusCode::CONFLICT, "reservation_conflict", message)
        }
        StockError::ConcurrentModification(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        StockError::AdminOverrideConflict {
            requested, reserved, ..
        } => json_error_with(
            StatusCode::CONFLICT,
            "admin_override_conflict",
            message,
            json!({ "requested": requested, "reserved": reserved }),
        ),
        StockError::Timeout { .. } => json_error(StatusCode::SERVICE_UNAVAILABLE, "timeout", message),
        StockError::Invariant(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "invariant_violation", message)
        }
        StockError::Ledger(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "ledger_error", message),
        StockError::Store(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    json_error_with(status, code, message, Value::Null)
}

/// Like [`json_error`], with the fields of `extra` merged into the body.
pub fn json_error_with(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    extra: Value,
) -> axum::response::Response {
    let mut body = json!({
        "error": code,
        "message": message.into(),
    });
    if let (Some(body), Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    (status, axum::Json(body)).into_response()
}
