//! Engine-level error model returned by every `StockService` operation.

use std::time::Duration;

use thiserror::Error;

use stockhold_core::{DomainError, OrderId, ProductItemId};
use stockhold_inventory::ShortLine;

use crate::ledger::LedgerError;
use crate::reservations::StoreError;

#[derive(Debug, Clone, Error)]
pub enum StockError {
    /// The product item has no stock line.
    #[error("product item {0} not found")]
    NotFound(ProductItemId),

    /// Malformed request (empty basket, zero quantity, out-of-range value).
    #[error("validation failed: {0}")]
    Validation(String),

    /// One or more lines exceed availability; nothing was reserved.
    #[error("insufficient stock for {} line(s)", lines.len())]
    InsufficientStock { lines: Vec<ShortLine> },

    /// No active hold for the order; the checkout flow must reserve again.
    #[error("no active reservation for order {0}")]
    ReservationNotFound(OrderId),

    /// The hold's checkout window elapsed before it was resolved.
    #[error("reservation for order {0} expired")]
    ReservationExpired(OrderId),

    /// The order already holds (or consumed) a different reservation.
    #[error("reservation conflict for order {order_id}: {reason}")]
    ReservationConflict { order_id: OrderId, reason: String },

    /// Contention detected by an atomic primitive; safe to retry.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// `UpdateStock` would drop stock below what is already reserved.
    #[error(
        "cannot set stock of {product_item_id} to {requested}: {reserved} unit(s) are reserved"
    )]
    AdminOverrideConflict {
        product_item_id: ProductItemId,
        requested: u64,
        reserved: u64,
    },

    /// The operation did not complete within its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A stored invariant does not hold (corrupt data or a logic bug).
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("stock ledger error: {0}")]
    Ledger(String),

    #[error("reservation store error: {0}")]
    Store(String),
}

impl StockError {
    /// Errors an internal retry loop may absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StockError::ConcurrentModification(_))
    }
}

impl From<DomainError> for StockError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => StockError::Validation(msg),
            DomainError::InvariantViolation(msg) => StockError::Invariant(msg),
            DomainError::IllegalTransition(msg) => StockError::ConcurrentModification(msg),
        }
    }
}

impl From<LedgerError> for StockError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::NotFound(id) => StockError::NotFound(id),
            LedgerError::Insufficient {
                product_item_id,
                on_hand,
                requested,
            } => StockError::Invariant(format!(
                "ledger holds {on_hand} of {product_item_id}, deduction needs {requested}"
            )),
            LedgerError::Concurrency(msg) => StockError::ConcurrentModification(msg),
            LedgerError::Rejected(inner) => *inner,
            LedgerError::Corrupt(msg) => StockError::Invariant(msg),
            LedgerError::Database(msg) => StockError::Ledger(msg),
        }
    }
}

impl From<StoreError> for StockError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Corrupt(msg) => StockError::Invariant(msg),
            other => StockError::Store(other.to_string()),
        }
    }
}
