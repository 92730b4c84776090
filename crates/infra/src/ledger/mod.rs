//! Stock ledger boundary: the durable store of record for `qty_in_stock`.
//!
//! The ledger is only touched by deductions, administrative overrides and
//! catalog registration. Reservations never write to it; they live in the
//! [`ReservationStore`](crate::reservations::ReservationStore).
//!
//! Implementations must serialize writers per SKU and acquire multi-SKU locks
//! in ascending `ProductItemId` order.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use stockhold_core::{OrderId, ProductItemId};
use stockhold_inventory::{ReservationLine, StockLine};

use crate::error::StockError;

pub use in_memory::InMemoryStockLedger;
pub use postgres::PostgresStockLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("stock line {0} not found")]
    NotFound(ProductItemId),

    /// A deduction would drive `qty_in_stock` negative.
    #[error("stock line {product_item_id} holds {on_hand}, cannot deduct {requested}")]
    Insufficient {
        product_item_id: ProductItemId,
        on_hand: u64,
        requested: u64,
    },

    /// Lost an optimistic race or a lock wait; retryable.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// An [`OverrideGuard`] refused the write.
    #[error("rejected: {0}")]
    Rejected(Box<StockError>),

    #[error("database error: {0}")]
    Database(String),

    /// A stored row cannot be decoded.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// Outcome of an idempotent deduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductOutcome {
    /// Quantities were removed; the updated lines in SKU order.
    Applied(Vec<StockLine>),
    /// A deduction for this order was already committed; nothing changed.
    AlreadyApplied,
}

/// Veto hook consulted by [`StockLedger::override_stock`] while the row is
/// locked, before the new quantity is committed.
#[async_trait]
pub trait OverrideGuard: Send + Sync {
    async fn admit(&self, proposed: &StockLine) -> Result<(), StockError>;
}

/// Guard that admits everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct AdmitAll;

#[async_trait]
impl OverrideGuard for AdmitAll {
    async fn admit(&self, _proposed: &StockLine) -> Result<(), StockError> {
        Ok(())
    }
}

#[async_trait]
pub trait StockLedger: Send + Sync + 'static {
    async fn get(&self, product_item_id: ProductItemId) -> Result<Option<StockLine>, LedgerError>;

    /// Lines that exist among `ids`, in ascending id order.
    async fn get_many(&self, ids: &[ProductItemId]) -> Result<Vec<StockLine>, LedgerError>;

    /// Permanently remove the quantities of a consumed reservation.
    ///
    /// All lines commit or none do. Keyed by `order_id`: a second call for the
    /// same order returns [`DeductOutcome::AlreadyApplied`].
    async fn deduct(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome, LedgerError>;

    /// Lines of a committed deduction, if any.
    async fn find_deduction(
        &self,
        order_id: OrderId,
    ) -> Result<Option<Vec<ReservationLine>>, LedgerError>;

    /// Set `qty_in_stock` to `new_qty`, creating the line if absent.
    async fn override_stock(
        &self,
        product_item_id: ProductItemId,
        new_qty: u64,
        now: DateTime<Utc>,
        guard: &dyn OverrideGuard,
    ) -> Result<StockLine, LedgerError>;

    /// Create the line if absent; returns whatever is stored afterwards.
    async fn register(&self, line: StockLine) -> Result<StockLine, LedgerError>;

    /// Catalog enable/disable. No-op (no version bump) when unchanged.
    async fn set_sellable(
        &self,
        product_item_id: ProductItemId,
        sellable: bool,
        now: DateTime<Utc>,
    ) -> Result<StockLine, LedgerError>;
}

/// Shared deduction arithmetic. Rows in `locked` are matched to `lines` by
/// product item id; the result follows the order of `lines`.
pub(crate) fn apply_deduction(
    locked: &[StockLine],
    lines: &[ReservationLine],
    now: DateTime<Utc>,
) -> Result<Vec<StockLine>, LedgerError> {
    lines
        .iter()
        .map(|line| {
            let current = locked
                .iter()
                .find(|row| row.product_item_id() == line.product_item_id)
                .ok_or(LedgerError::NotFound(line.product_item_id))?;
            current.deduct(line.quantity, now).map_err(|_| LedgerError::Insufficient {
                product_item_id: line.product_item_id,
                on_hand: current.qty_in_stock(),
                requested: line.quantity,
            })
        })
        .collect()
}
