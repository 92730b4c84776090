use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/check-stock", post(check_stock))
        .route("/reserve-stock", post(reserve_stock))
        .route("/deduct-stock", post(deduct_stock))
        .route("/release-stock", post(release_stock))
        .route("/:id/stock", get(get_stock).put(update_stock))
}

pub async fn get_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let product_item_id = match dto::parse_product_item_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.stock.get_stock(product_item_id).await {
        Ok(line) => (StatusCode::OK, Json(dto::StockResponse::from(&line))).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn check_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CheckStockRequest>,
) -> axum::response::Response {
    let lines = match dto::parse_lines(body.lines) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.stock.check_stock(lines).await {
        Ok(availability) => {
            (StatusCode::OK, Json(dto::CheckStockResponse::from(availability))).into_response()
        }
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn reserve_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ReserveStockRequest>,
) -> axum::response::Response {
    let order_id = match dto::parse_order_id(&body.order_id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let lines = match dto::parse_lines(body.lines) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.stock.reserve_stock(order_id, lines).await {
        Ok(receipt) => (StatusCode::OK, Json(dto::ReservationResponse::from(receipt))).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn deduct_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::OrderRequest>,
) -> axum::response::Response {
    let order_id = match dto::parse_order_id(&body.order_id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.stock.deduct_stock(order_id).await {
        Ok(receipt) => (StatusCode::OK, Json(dto::DeductResponse::from(receipt))).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn release_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::OrderRequest>,
) -> axum::response::Response {
    let order_id = match dto::parse_order_id(&body.order_id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.stock.release_stock(order_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(dto::ReleaseResponse { order_id, outcome }),
        )
            .into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}

pub async fn update_stock(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::UpdateStockRequest>,
) -> axum::response::Response {
    let product_item_id = match dto::parse_product_item_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let new_stock = match dto::parse_quantity("new_stock", body.new_stock) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.stock.update_stock(product_item_id, new_stock).await {
        Ok(line) => (StatusCode::OK, Json(dto::StockResponse::from(&line))).into_response(),
        Err(e) => errors::stock_error_to_response(e),
    }
}
