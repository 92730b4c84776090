//! `StockService`: the public stock operations.
//!
//! Composes the [`StockLedger`] (store of record) with the
//! [`ReservationStore`] (holds and the availability mirror). Every operation
//! runs under `EngineConfig::op_timeout`; contention reported as
//! [`StockError::ConcurrentModification`] is retried with bounded backoff.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use stockhold_core::{Clock, OrderId, ProductItemId};
use stockhold_inventory::{
    normalize_lines, LineAvailability, ReleaseReason, Reservation, ReservationLine, ReservationState,
    StockLevel, StockLine,
};

use crate::config::EngineConfig;
use crate::error::StockError;
use crate::ledger::{DeductOutcome, OverrideGuard, StockLedger};
use crate::reservations::{
    ConsumeClaim, FinishOutcome, OverrideVerdict, ReleaseOutcome, ReservationStore, ReserveOutcome,
};
use crate::sweeper::ReservationSweeper;

/// Result of `reserve_stock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveReceipt {
    pub reservation: Reservation,
    /// The same basket was already held for this order.
    pub replayed: bool,
}

/// Result of `deduct_stock`: ledger lines after the deduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeductReceipt {
    pub order_id: OrderId,
    pub lines: Vec<StockLine>,
    pub replayed: bool,
}

/// What `release_stock` did. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Released,
    /// A deduction holds the claim; the hold is released if it aborts.
    Deferred,
    AlreadyTerminal,
    NotFound,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseStatus::Released => "released",
            ReleaseStatus::Deferred => "deferred",
            ReleaseStatus::AlreadyTerminal => "already_terminal",
            ReleaseStatus::NotFound => "not_found",
        }
    }
}

/// Consulted by the ledger while the overridden row is locked: rejects a
/// quantity below the active reservations and moves the mirror otherwise.
struct MirrorGuard<'a> {
    store: &'a dyn ReservationStore,
    now: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl OverrideGuard for MirrorGuard<'_> {
    async fn admit(&self, proposed: &StockLine) -> Result<(), StockError> {
        match self.store.admit_override(proposed, self.now).await? {
            OverrideVerdict::Admitted { .. } => Ok(()),
            OverrideVerdict::Conflict { reserved } => Err(StockError::AdminOverrideConflict {
                product_item_id: proposed.product_item_id(),
                requested: proposed.qty_in_stock(),
                reserved,
            }),
        }
    }
}

#[derive(Clone)]
pub struct StockService {
    ledger: Arc<dyn StockLedger>,
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl std::fmt::Debug for StockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockService")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl StockService {
    pub fn new(
        ledger: Arc<dyn StockLedger>,
        store: Arc<dyn ReservationStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A sweeper sharing this service's backends and clock.
    pub fn sweeper(&self) -> ReservationSweeper {
        ReservationSweeper::new(
            self.store.clone(),
            self.ledger.clone(),
            self.clock.clone(),
            self.config.sweeper.clone(),
        )
    }

    /// `GetStock`: the ledger line, straight from the store of record.
    #[instrument(skip(self), fields(product_item_id = %product_item_id), err)]
    pub async fn get_stock(&self, product_item_id: ProductItemId) -> Result<StockLine, StockError> {
        self.bounded("get_stock", async {
            self.ledger
                .get(product_item_id)
                .await?
                .ok_or(StockError::NotFound(product_item_id))
        })
        .await
    }

    /// `CheckStock`: per-line availability, nothing is reserved.
    #[instrument(skip(self, lines), fields(lines = lines.len()), err)]
    pub async fn check_stock(
        &self,
        lines: Vec<ReservationLine>,
    ) -> Result<Vec<LineAvailability>, StockError> {
        let lines = normalize_lines(lines)?;
        self.bounded("check_stock", async {
            let ids: Vec<ProductItemId> = lines.iter().map(|l| l.product_item_id).collect();
            let levels = self.seeded_levels(&ids).await?;
            Ok(lines
                .iter()
                .zip(levels.iter())
                .map(|(line, level)| LineAvailability::evaluate(level, line.quantity))
                .collect())
        })
        .await
    }

    /// `ReserveStock`: all-or-nothing hold on every line for the checkout window.
    #[instrument(skip(self, lines), fields(order_id = %order_id, replayed = tracing::field::Empty), err)]
    pub async fn reserve_stock(
        &self,
        order_id: OrderId,
        lines: Vec<ReservationLine>,
    ) -> Result<ReserveReceipt, StockError> {
        let reservation = Reservation::new(
            order_id,
            lines,
            self.clock.now(),
            self.config.checkout_window_chrono(),
        )?;
        let reservation = &reservation;

        let receipt = self
            .bounded(
                "reserve_stock",
                self.with_retry("reserve_stock", move || self.reserve_once(reservation)),
            )
            .await?;
        tracing::Span::current().record("replayed", receipt.replayed);
        if !receipt.replayed {
            info!(
                order_id = %order_id,
                lines = receipt.reservation.lines().len(),
                expires_at = %receipt.reservation.expires_at(),
                "stock reserved"
            );
        }
        Ok(receipt)
    }

    async fn reserve_once(&self, reservation: &Reservation) -> Result<ReserveReceipt, StockError> {
        let order_id = reservation.order_id();
        let mut seeded = false;
        loop {
            match self.store.reserve(reservation, self.clock.now()).await? {
                ReserveOutcome::Reserved(r) => {
                    return Ok(ReserveReceipt {
                        reservation: r,
                        replayed: false,
                    });
                }
                ReserveOutcome::AlreadyReserved(r) => {
                    return Ok(ReserveReceipt {
                        reservation: r,
                        replayed: true,
                    });
                }
                ReserveOutcome::Insufficient(lines) => {
                    return Err(StockError::InsufficientStock { lines });
                }
                ReserveOutcome::Conflict { existing } => {
                    return Err(StockError::ReservationConflict {
                        order_id,
                        reason: format!("order already has a {} reservation", existing.label()),
                    });
                }
                ReserveOutcome::Unseeded(ids) if !seeded => {
                    self.seed(&ids).await?;
                    seeded = true;
                }
                ReserveOutcome::Unseeded(ids) => {
                    return Err(StockError::Invariant(format!(
                        "{} stock line(s) still unseeded after sync",
                        ids.len()
                    )));
                }
            }
        }
    }

    /// `DeductStock`: turn the order's hold into a permanent ledger deduction.
    #[instrument(skip(self), fields(order_id = %order_id, replayed = tracing::field::Empty), err)]
    pub async fn deduct_stock(&self, order_id: OrderId) -> Result<DeductReceipt, StockError> {
        let receipt = self
            .bounded(
                "deduct_stock",
                self.with_retry("deduct_stock", move || self.deduct_once(order_id)),
            )
            .await?;
        tracing::Span::current().record("replayed", receipt.replayed);
        Ok(receipt)
    }

    async fn deduct_once(&self, order_id: OrderId) -> Result<DeductReceipt, StockError> {
        let now = self.clock.now();
        let claimed = match self.store.begin_consume(order_id, now).await? {
            ConsumeClaim::Claimed(r) => r,
            ConsumeClaim::AlreadyConsumed(r) => {
                let ids: Vec<ProductItemId> = r.product_item_ids().collect();
                return self.replayed_deduction(order_id, &ids).await;
            }
            ConsumeClaim::InProgress => {
                // An earlier attempt may have committed and then run out of time.
                return match self.ledger.find_deduction(order_id).await? {
                    Some(lines) => self.finish_committed_claim(order_id, &lines).await,
                    None => Err(StockError::ConcurrentModification(format!(
                        "a deduction for order {order_id} is in progress"
                    ))),
                };
            }
            ConsumeClaim::Expired => {
                self.store.release(order_id, ReleaseReason::Expired, now).await?;
                info!(order_id = %order_id, "deduction refused: hold expired");
                return Err(StockError::ReservationExpired(order_id));
            }
            ConsumeClaim::Released(r) => {
                if let Some(lines) = self.ledger.find_deduction(order_id).await? {
                    return self.replayed_from_record(order_id, &lines).await;
                }
                return Err(match r.state() {
                    ReservationState::Released {
                        reason: ReleaseReason::Expired,
                        ..
                    } => StockError::ReservationExpired(order_id),
                    _ => StockError::ReservationNotFound(order_id),
                });
            }
            ConsumeClaim::NotFound => {
                // The tombstone may be gone while the ledger still holds the record.
                return match self.ledger.find_deduction(order_id).await? {
                    Some(lines) => self.replayed_from_record(order_id, &lines).await,
                    None => Err(StockError::ReservationNotFound(order_id)),
                };
            }
        };

        let ids: Vec<ProductItemId> = claimed.product_item_ids().collect();
        let (lines, replayed) = match self.ledger.deduct(order_id, claimed.lines(), now).await {
            Ok(DeductOutcome::Applied(lines)) => (lines, false),
            Ok(DeductOutcome::AlreadyApplied) => (self.ledger.get_many(&ids).await?, true),
            Err(e) => {
                let err = StockError::from(e);
                let decision = self.store.abort_consume(order_id, self.clock.now()).await?;
                warn!(order_id = %order_id, error = %err, decision = ?decision, "ledger deduction failed; claim aborted");
                self.resync(&ids).await;
                return Err(err);
            }
        };

        match self.store.finish_consume(order_id, &lines, self.clock.now()).await? {
            FinishOutcome::Consumed(_) | FinishOutcome::AlreadyConsumed(_) => {}
            FinishOutcome::Orphaned => {
                warn!(order_id = %order_id, "claim vanished after ledger commit");
                self.resync(&ids).await;
            }
        }
        info!(order_id = %order_id, lines = lines.len(), replayed, "stock deducted");
        Ok(DeductReceipt {
            order_id,
            lines,
            replayed,
        })
    }

    /// Settle a claim whose ledger deduction is already committed.
    async fn finish_committed_claim(
        &self,
        order_id: OrderId,
        recorded: &[ReservationLine],
    ) -> Result<DeductReceipt, StockError> {
        let ids: Vec<ProductItemId> = recorded.iter().map(|l| l.product_item_id).collect();
        let lines = self.ledger.get_many(&ids).await?;
        match self.store.finish_consume(order_id, &lines, self.clock.now()).await? {
            FinishOutcome::Consumed(_) => {
                info!(order_id = %order_id, "committed claim finished on retry");
            }
            FinishOutcome::AlreadyConsumed(_) => {}
            FinishOutcome::Orphaned => {
                warn!(order_id = %order_id, "claim vanished after ledger commit");
                self.resync(&ids).await;
            }
        }
        Ok(DeductReceipt {
            order_id,
            lines,
            replayed: true,
        })
    }

    async fn replayed_deduction(
        &self,
        order_id: OrderId,
        ids: &[ProductItemId],
    ) -> Result<DeductReceipt, StockError> {
        debug!(order_id = %order_id, "deduction already applied");
        Ok(DeductReceipt {
            order_id,
            lines: self.ledger.get_many(ids).await?,
            replayed: true,
        })
    }

    async fn replayed_from_record(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
    ) -> Result<DeductReceipt, StockError> {
        let ids: Vec<ProductItemId> = lines.iter().map(|l| l.product_item_id).collect();
        self.replayed_deduction(order_id, &ids).await
    }

    /// `ReleaseStock`: cancel the order's hold. Missing and terminal holds are
    /// not errors.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn release_stock(&self, order_id: OrderId) -> Result<ReleaseStatus, StockError> {
        self.bounded(
            "release_stock",
            self.with_retry("release_stock", move || async move {
                let now = self.clock.now();
                match self.store.release(order_id, ReleaseReason::Cancelled, now).await? {
                    ReleaseOutcome::Released(r) => {
                        info!(order_id = %order_id, lines = r.lines().len(), "reservation released");
                        Ok(ReleaseStatus::Released)
                    }
                    ReleaseOutcome::Deferred(_) => {
                        info!(order_id = %order_id, "release deferred behind in-flight deduction");
                        Ok(ReleaseStatus::Deferred)
                    }
                    ReleaseOutcome::AlreadyTerminal(_) => Ok(ReleaseStatus::AlreadyTerminal),
                    ReleaseOutcome::NotFound => Ok(ReleaseStatus::NotFound),
                    other @ (ReleaseOutcome::Busy | ReleaseOutcome::NotDue) => Err(StockError::Invariant(
                        format!("cancellation answered with an expiry outcome: {other:?}"),
                    )),
                }
            }),
        )
        .await
    }

    /// `UpdateStock`: administrative override of `qty_in_stock`.
    ///
    /// Refused with [`StockError::AdminOverrideConflict`] when `new_qty` is
    /// below the active reservations; creates the line for an unknown SKU.
    #[instrument(skip(self), fields(product_item_id = %product_item_id), err)]
    pub async fn update_stock(
        &self,
        product_item_id: ProductItemId,
        new_qty: u64,
    ) -> Result<StockLine, StockError> {
        self.bounded(
            "update_stock",
            self.with_retry("update_stock", move || self.update_once(product_item_id, new_qty)),
        )
        .await
    }

    async fn update_once(
        &self,
        product_item_id: ProductItemId,
        new_qty: u64,
    ) -> Result<StockLine, StockError> {
        // Seed first so the guard compares against a mirror holding the
        // current reservations.
        if let Some(current) = self.ledger.get(product_item_id).await? {
            self.store.sync_stock(std::slice::from_ref(&current), false).await?;
        }

        let guard = MirrorGuard {
            store: self.store.as_ref(),
            now: self.clock.now(),
        };
        match self
            .ledger
            .override_stock(product_item_id, new_qty, guard.now, &guard)
            .await
        {
            Ok(line) => {
                info!(
                    product_item_id = %product_item_id,
                    qty_in_stock = line.qty_in_stock(),
                    version = line.version(),
                    "stock updated"
                );
                Ok(line)
            }
            Err(e) => {
                let err = StockError::from(e);
                if !matches!(err, StockError::AdminOverrideConflict { .. }) {
                    // The guard may have moved the mirror before the write failed.
                    self.force_resync(product_item_id).await;
                }
                Err(err)
            }
        }
    }

    /// Catalog hook: create a stock line if absent, optionally disabled.
    #[instrument(skip(self), fields(product_item_id = %product_item_id), err)]
    pub async fn register_line(
        &self,
        product_item_id: ProductItemId,
        qty_in_stock: u64,
        sellable: bool,
    ) -> Result<StockLine, StockError> {
        self.bounded("register_line", async {
            let now = self.clock.now();
            let mut line = self
                .ledger
                .register(StockLine::new(product_item_id, qty_in_stock, now))
                .await?;
            if line.is_sellable() != sellable {
                line = self.ledger.set_sellable(product_item_id, sellable, now).await?;
            }
            self.store.sync_stock(std::slice::from_ref(&line), false).await?;
            Ok(line)
        })
        .await
    }

    /// Catalog hook: enable or disable a line for new reservations.
    #[instrument(skip(self), fields(product_item_id = %product_item_id), err)]
    pub async fn set_sellable(
        &self,
        product_item_id: ProductItemId,
        sellable: bool,
    ) -> Result<StockLine, StockError> {
        self.bounded("set_sellable", async {
            let line = self
                .ledger
                .set_sellable(product_item_id, sellable, self.clock.now())
                .await?;
            self.store.sync_stock(std::slice::from_ref(&line), false).await?;
            Ok(line)
        })
        .await
    }

    /// Store levels for `ids`, seeding missing mirrors from the ledger.
    async fn seeded_levels(&self, ids: &[ProductItemId]) -> Result<Vec<StockLevel>, StockError> {
        let mut levels = self.store.levels(ids, self.clock.now()).await?;
        let missing: Vec<ProductItemId> = ids
            .iter()
            .zip(levels.iter())
            .filter(|(_, level)| level.is_none())
            .map(|(id, _)| *id)
            .collect();
        if !missing.is_empty() {
            self.seed(&missing).await?;
            levels = self.store.levels(ids, self.clock.now()).await?;
        }

        ids.iter()
            .zip(levels)
            .map(|(id, level)| level.ok_or(StockError::NotFound(*id)))
            .collect()
    }

    /// Copy ledger lines into the store mirror. Unknown SKUs are `NotFound`.
    async fn seed(&self, ids: &[ProductItemId]) -> Result<(), StockError> {
        let lines = self.ledger.get_many(ids).await?;
        if let Some(missing) = ids
            .iter()
            .find(|id| !lines.iter().any(|l| l.product_item_id() == **id))
        {
            return Err(StockError::NotFound(*missing));
        }
        debug!(lines = lines.len(), "seeding stock mirror");
        self.store.sync_stock(&lines, false).await?;
        Ok(())
    }

    /// Best-effort mirror refresh after a failed write.
    async fn resync(&self, ids: &[ProductItemId]) {
        let result = async {
            let lines = self.ledger.get_many(ids).await?;
            self.store.sync_stock(&lines, false).await?;
            Ok::<_, StockError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(error = %e, "mirror resync failed");
        }
    }

    async fn force_resync(&self, product_item_id: ProductItemId) {
        let result = async {
            if let Some(line) = self.ledger.get(product_item_id).await? {
                self.store.sync_stock(std::slice::from_ref(&line), true).await?;
            }
            Ok::<_, StockError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(product_item_id = %product_item_id, error = %e, "forced mirror resync failed");
        }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, StockError>>,
    ) -> Result<T, StockError> {
        let after = self.config.op_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = after.as_millis() as u64, "operation timed out");
                Err(StockError::Timeout { operation, after })
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, StockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StockError>>,
    {
        let policy = &self.config.retry;
        let mut n: u32 = 1;
        loop {
            match attempt().await {
                Err(e) if e.is_retryable() && n < policy.max_attempts => {
                    let delay = policy.backoff(n);
                    debug!(operation, attempt = n, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    n += 1;
                }
                other => return other,
            }
        }
    }
}
