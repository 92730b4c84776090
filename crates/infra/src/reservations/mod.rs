//! Reservation store boundary.
//!
//! The store keeps, per SKU, a mirror of the ledger line (`on_hand`, `version`,
//! `sellable`) next to a `reserved` counter, plus one record per order. The
//! availability check and the reservation increment happen in one atomic step,
//! so concurrent reservations can never oversell a SKU.
//!
//! Mirror writes are version-gated: a snapshot older than the mirror is
//! ignored unless forced. Holds whose window elapsed stop counting against
//! availability at `expires_at`, before the sweeper has released them.

pub mod in_memory;

#[cfg(feature = "redis")]
pub mod expiry_listener;
#[cfg(feature = "redis")]
pub mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use stockhold_core::{OrderId, ProductItemId};
use stockhold_inventory::{
    AbortDecision, ReleaseReason, Reservation, ReservationState, ShortLine, StockLevel, StockLine,
};

pub use in_memory::InMemoryReservationStore;

#[cfg(feature = "redis")]
pub use expiry_listener::{RedisExpiryListener, RedisExpiryListenerHandle};
#[cfg(feature = "redis")]
pub use redis_store::{RedisReservationStore, DEFAULT_KEY_PREFIX};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    /// Stored data cannot be decoded or violates a store invariant.
    #[error("corrupt reservation data: {0}")]
    Corrupt(String),

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// New hold recorded; quantities now count against availability.
    Reserved(Reservation),
    /// The same basket is already active for this order.
    AlreadyReserved(Reservation),
    /// At least one line is short; nothing was reserved.
    Insufficient(Vec<ShortLine>),
    /// These SKUs have no mirror yet; seed them and retry.
    Unseeded(Vec<ProductItemId>),
    /// The order already owns a record that cannot be replayed by this request.
    Conflict { existing: ReservationState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideVerdict {
    /// Mirror now reflects the proposed line.
    Admitted { reserved: u64 },
    /// Active reservations exceed the proposed quantity; mirror unchanged.
    Conflict { reserved: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeClaim {
    /// The caller now owns the deduction for this hold.
    Claimed(Reservation),
    AlreadyConsumed(Reservation),
    /// Another deduction owns the claim.
    InProgress,
    /// The window elapsed before the claim.
    Expired,
    Released(Reservation),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    Consumed(Reservation),
    AlreadyConsumed(Reservation),
    /// The claim vanished (record purged or released); the ledger write stands.
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Quantities returned to availability.
    Released(Reservation),
    /// A deduction holds the claim; cancellation applies if it aborts.
    Deferred(Reservation),
    /// Expiry skipped: a deduction holds the claim.
    Busy,
    /// Expiry skipped: the window is still open.
    NotDue,
    AlreadyTerminal(Reservation),
    NotFound,
}

#[async_trait]
pub trait ReservationStore: Send + Sync + 'static {
    /// Refresh the per-SKU mirrors from ledger lines. Older versions are ignored
    /// unless `force` is set.
    async fn sync_stock(&self, lines: &[StockLine], force: bool) -> Result<(), StoreError>;

    /// Current levels, `None` for SKUs without a mirror. Same order as `ids`.
    async fn levels(
        &self,
        ids: &[ProductItemId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Option<StockLevel>>, StoreError>;

    /// Atomically check every line and, if all fit, record the hold.
    async fn reserve(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Check an administrative quantity against active reservations and, if it
    /// fits, move the mirror to `proposed`.
    async fn admit_override(
        &self,
        proposed: &StockLine,
        now: DateTime<Utc>,
    ) -> Result<OverrideVerdict, StoreError>;

    async fn find(&self, order_id: OrderId) -> Result<Option<Reservation>, StoreError>;

    /// `Held → Consuming`.
    async fn begin_consume(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<ConsumeClaim, StoreError>;

    /// `Consuming → Consumed`: drops the hold and applies the ledger lines to the
    /// mirror in the same step, so availability never double counts.
    async fn finish_consume(
        &self,
        order_id: OrderId,
        synced: &[StockLine],
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, StoreError>;

    /// Undo a claim after a failed ledger write.
    async fn abort_consume(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<AbortDecision, StoreError>;

    async fn release(
        &self,
        order_id: OrderId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Held records whose window elapsed, oldest first.
    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>, StoreError>;

    /// Claims older than `claimed_before`.
    async fn stalled_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderId>, StoreError>;
}
