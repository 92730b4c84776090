use axum::Router;

pub mod stock;
pub mod system;

/// Router for the stock endpoints consumed by Cart/Order.
pub fn router() -> Router {
    Router::new().nest("/product-items", stock::router())
}
