use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Non-secret runtime settings, for operators.
pub async fn info(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let config = services.stock.config();
    Json(serde_json::json!({
        "backend": services.backend,
        "checkout_window_secs": config.checkout_window.as_secs(),
        "op_timeout_ms": config.op_timeout.as_millis() as u64,
        "sweep_interval_ms": config.sweeper.interval.as_millis() as u64,
    }))
}
