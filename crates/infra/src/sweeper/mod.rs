//! Reservation sweeper: compensates for holds whose checkout window elapsed.
//!
//! A lapsed hold already stops counting against availability, but its
//! quantities stay in the store's `reserved` counter until released. The
//! sweeper releases them through the store's compare-and-release, which only
//! fires on a `Held` record past `expires_at`; duplicate signals therefore
//! no-op.
//!
//! Triggers:
//! - periodic scan of due holds (`SweeperConfig::interval`)
//! - expiry notifications (e.g. Redis keyspace events) via [`ExpiryNotifier`]
//!
//! The same pass recovers claims stuck in `Consuming` beyond
//! `consume_grace`: finished when the ledger holds the order's deduction,
//! aborted otherwise.

pub mod single_flight;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use stockhold_core::{Clock, OrderId, ProductItemId};
use stockhold_inventory::{AbortDecision, ReleaseReason, ReservationState};

use crate::config::SweeperConfig;
use crate::error::StockError;
use crate::ledger::StockLedger;
use crate::reservations::{FinishOutcome, ReleaseOutcome, ReservationStore};

pub use single_flight::{FlightGuard, SingleFlight};

/// Counters for one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub released: usize,
    pub finished_claims: usize,
    pub aborted_claims: usize,
    pub skipped: usize,
    pub failures: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// What one compensation attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    Released,
    /// Not due, claimed, already terminal, gone, or another task owns a SKU.
    Skipped,
}

/// What one stalled-claim recovery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRecovery {
    /// The ledger had committed; the hold is now consumed.
    Finished,
    /// The ledger had not committed; the claim was undone.
    Aborted(AbortDecision),
    Skipped,
}

/// Cheap handle for pushing "this order may be due" signals to the sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryNotifier {
    tx: mpsc::Sender<OrderId>,
}

impl ExpiryNotifier {
    /// Non-blocking. A full queue drops the signal; the periodic scan covers it.
    pub fn notify(&self, order_id: OrderId) -> bool {
        match self.tx.try_send(order_id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(order_id = %order_id, "expiry queue full; leaving order to the scan");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

pub struct ReservationSweeper {
    store: Arc<dyn ReservationStore>,
    ledger: Arc<dyn StockLedger>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
    flights: SingleFlight<ProductItemId>,
}

impl std::fmt::Debug for ReservationSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationSweeper")
            .field("config", &self.config)
            .field("in_flight", &self.flights.in_flight())
            .finish_non_exhaustive()
    }
}

impl ReservationSweeper {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        ledger: Arc<dyn StockLedger>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            config,
            flights: SingleFlight::new(),
        }
    }

    /// Claims taken at or before this instant count as stalled.
    fn stalled_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.consume_grace)
            .ok()
            .and_then(|grace| now.checked_sub_signed(grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// One scan: release due holds, then recover stalled claims.
    #[instrument(skip(self), err)]
    pub async fn sweep_once(&self) -> Result<SweepReport, StockError> {
        let mut report = SweepReport::default();
        let now = self.clock.now();

        for order_id in self.store.due_for_expiry(now, self.config.batch_size).await? {
            match self.compensate_bounded(order_id).await {
                Ok(Compensation::Released) => report.released += 1,
                Ok(Compensation::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "expiry compensation failed");
                    report.failures += 1;
                }
            }
        }

        let claimed_before = self.stalled_cutoff(now);
        for order_id in self
            .store
            .stalled_claims(claimed_before, self.config.batch_size)
            .await?
        {
            match self.recover_claim(order_id).await {
                Ok(ClaimRecovery::Finished) => report.finished_claims += 1,
                Ok(ClaimRecovery::Aborted(_)) => report.aborted_claims += 1,
                Ok(ClaimRecovery::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(order_id = %order_id, error = %e, "stalled claim recovery failed");
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Release one order's hold if it is still `Held` and past its window.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn compensate(&self, order_id: OrderId) -> Result<Compensation, StockError> {
        let Some(record) = self.store.find(order_id).await? else {
            return Ok(Compensation::Skipped);
        };
        let skus: Vec<ProductItemId> = record.product_item_ids().collect();
        let Some(_flight) = self.flights.try_acquire(&skus) else {
            debug!(order_id = %order_id, "skus busy; retrying on a later pass");
            return Ok(Compensation::Skipped);
        };

        let now = self.clock.now();
        match self.store.release(order_id, ReleaseReason::Expired, now).await? {
            ReleaseOutcome::Released(released) => {
                info!(
                    order_id = %order_id,
                    lines = released.lines().len(),
                    "expired reservation released"
                );
                Ok(Compensation::Released)
            }
            _ => Ok(Compensation::Skipped),
        }
    }

    /// [`ReservationSweeper::compensate`] under `task_timeout`.
    pub async fn compensate_bounded(&self, order_id: OrderId) -> Result<Compensation, StockError> {
        let after = self.config.task_timeout;
        match tokio::time::timeout(after, self.compensate(order_id)).await {
            Ok(result) => result,
            Err(_) => Err(StockError::Timeout {
                operation: "compensate",
                after,
            }),
        }
    }

    /// Settle a claim whose deduction never reported back.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub async fn recover_claim(&self, order_id: OrderId) -> Result<ClaimRecovery, StockError> {
        let Some(record) = self.store.find(order_id).await? else {
            return Ok(ClaimRecovery::Skipped);
        };
        let now = self.clock.now();
        match record.state() {
            ReservationState::Consuming { claimed_at } if claimed_at <= self.stalled_cutoff(now) => {}
            _ => return Ok(ClaimRecovery::Skipped),
        }

        let skus: Vec<ProductItemId> = record.product_item_ids().collect();
        let Some(_flight) = self.flights.try_acquire(&skus) else {
            return Ok(ClaimRecovery::Skipped);
        };

        if self.ledger.find_deduction(order_id).await?.is_some() {
            let synced = self.ledger.get_many(&skus).await?;
            return match self.store.finish_consume(order_id, &synced, now).await? {
                FinishOutcome::Consumed(_) => {
                    info!(order_id = %order_id, "stalled claim finished from ledger record");
                    Ok(ClaimRecovery::Finished)
                }
                _ => Ok(ClaimRecovery::Skipped),
            };
        }

        let decision = self.store.abort_consume(order_id, now).await?;
        // The ledger rows may have moved while the claim was open.
        let current = self.ledger.get_many(&skus).await?;
        self.store.sync_stock(&current, false).await?;
        warn!(order_id = %order_id, decision = ?decision, "stalled claim aborted");
        Ok(ClaimRecovery::Aborted(decision))
    }

    /// Run the sweeper on the current tokio runtime until shut down.
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (notify_tx, mut notify_rx) = mpsc::channel::<OrderId>(self.config.notify_capacity);
        let permits = self.config.max_concurrent;
        let semaphore = Arc::new(Semaphore::new(permits));
        let interval = self.config.interval;

        let sweeper = self;
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => match sweeper.sweep_once().await {
                        Ok(report) if !report.is_idle() => info!(
                            released = report.released,
                            finished_claims = report.finished_claims,
                            aborted_claims = report.aborted_claims,
                            skipped = report.skipped,
                            failures = report.failures,
                            "sweep pass complete"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "sweep pass failed; retrying next tick"),
                    },
                    Some(order_id) = notify_rx.recv() => {
                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(TryAcquireError::NoPermits) => {
                                debug!(order_id = %order_id, "compensation slots busy; leaving order to the scan");
                                continue;
                            }
                            Err(TryAcquireError::Closed) => break,
                        };
                        let worker = sweeper.clone();
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = worker.compensate_bounded(order_id).await {
                                warn!(order_id = %order_id, error = %e, "notified compensation failed");
                            }
                        });
                    }
                }
            }

            // Wait for in-flight compensations.
            let _ = semaphore
                .acquire_many(u32::try_from(permits).unwrap_or(u32::MAX))
                .await;
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            notifier: ExpiryNotifier { tx: notify_tx },
            join,
        }
    }
}

/// Handle to a running sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    notifier: ExpiryNotifier,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn notifier(&self) -> ExpiryNotifier {
        self.notifier.clone()
    }

    /// Stop the loop and wait for in-flight work.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "sweeper task ended abnormally");
        }
    }
}
