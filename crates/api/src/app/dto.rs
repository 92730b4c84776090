use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockhold_core::{OrderId, ProductItemId};
use stockhold_infra::{DeductReceipt, ReleaseStatus, ReserveReceipt};
use stockhold_inventory::{LineAvailability, ReservationLine, StockLine};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct LineRequest {
    pub product_item_id: String,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct CheckStockRequest {
    pub lines: Vec<LineRequest>,
}

#[derive(Debug, Deserialize)]
pub struct ReserveStockRequest {
    pub order_id: String,
    pub lines: Vec<LineRequest>,
}

/// Body of deduct-stock and release-stock.
#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStockRequest {
    pub new_stock: i64,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct StockResponse {
    pub product_item_id: ProductItemId,
    pub stock: u64,
    pub status: &'static str,
}

impl From<&StockLine> for StockResponse {
    fn from(line: &StockLine) -> Self {
        Self {
            product_item_id: line.product_item_id(),
            stock: line.qty_in_stock(),
            status: line.status().as_str(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckStockResponse {
    pub lines: Vec<LineAvailability>,
    pub all_available: bool,
}

impl From<Vec<LineAvailability>> for CheckStockResponse {
    fn from(lines: Vec<LineAvailability>) -> Self {
        Self {
            all_available: lines.iter().all(|l| l.sufficient),
            lines,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReservationResponse {
    pub order_id: OrderId,
    pub state: &'static str,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lines: Vec<ReservationLine>,
    pub replayed: bool,
}

impl From<ReserveReceipt> for ReservationResponse {
    fn from(receipt: ReserveReceipt) -> Self {
        let r = receipt.reservation;
        Self {
            order_id: r.order_id(),
            state: r.state().label(),
            created_at: r.created_at(),
            expires_at: r.expires_at(),
            lines: r.lines().to_vec(),
            replayed: receipt.replayed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeductedLine {
    pub product_item_id: ProductItemId,
    pub stock: u64,
}

#[derive(Debug, Serialize)]
pub struct DeductResponse {
    pub order_id: OrderId,
    pub lines: Vec<DeductedLine>,
    pub replayed: bool,
}

impl From<DeductReceipt> for DeductResponse {
    fn from(receipt: DeductReceipt) -> Self {
        Self {
            order_id: receipt.order_id,
            lines: receipt
                .lines
                .iter()
                .map(|l| DeductedLine {
                    product_item_id: l.product_item_id(),
                    stock: l.qty_in_stock(),
                })
                .collect(),
            replayed: receipt.replayed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub order_id: OrderId,
    pub outcome: ReleaseStatus,
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_product_item_id(s: &str) -> Result<ProductItemId, axum::response::Response> {
    s.parse().map_err(|_| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_id",
            "invalid product item id",
        )
    })
}

pub fn parse_order_id(s: &str) -> Result<OrderId, axum::response::Response> {
    s.parse()
        .map_err(|_| errors::json_error(axum::http::StatusCode::BAD_REQUEST, "invalid_id", "invalid order id"))
}

pub fn parse_quantity(field: &str, value: i64) -> Result<u64, axum::response::Response> {
    u64::try_from(value).map_err(|_| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "validation_error",
            format!("{field} must not be negative"),
        )
    })
}

/// Zero quantities pass through; the service rejects them with the SKU named.
pub fn parse_lines(lines: Vec<LineRequest>) -> Result<Vec<ReservationLine>, axum::response::Response> {
    lines
        .into_iter()
        .map(|l| {
            Ok(ReservationLine::new(
                parse_product_item_id(&l.product_item_id)?,
                parse_quantity("quantity", l.quantity)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_quantities_are_rejected_before_the_service() {
        let lines = vec![LineRequest {
            product_item_id: ProductItemId::new().to_string(),
            quantity: -1,
        }];
        let res = parse_lines(lines).unwrap_err();
        assert_eq!(res.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn check_response_is_all_available_only_when_every_line_fits() {
        let id = ProductItemId::new();
        let ok = LineAvailability {
            product_item_id: id,
            requested: 1,
            available: 2,
            sufficient: true,
        };
        let short = LineAvailability {
            sufficient: false,
            requested: 3,
            ..ok
        };
        assert!(CheckStockResponse::from(vec![ok]).all_available);
        assert!(!CheckStockResponse::from(vec![ok, short]).all_available);
    }
}
