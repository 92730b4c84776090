//! In-memory stock ledger for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use stockhold_core::{OrderId, ProductItemId};
use stockhold_inventory::{ReservationLine, StockLine};

use super::{apply_deduction, DeductOutcome, LedgerError, OverrideGuard, StockLedger};

type Row = Arc<Mutex<Option<StockLine>>>;

/// Per-row async mutexes stand in for `SELECT ... FOR UPDATE`.
#[derive(Debug, Default)]
pub struct InMemoryStockLedger {
    rows: RwLock<HashMap<ProductItemId, Row>>,
    deductions: Mutex<HashMap<OrderId, Vec<ReservationLine>>>,
}

impl InMemoryStockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(&self, id: ProductItemId) -> Result<Option<Row>, LedgerError> {
        Ok(self
            .rows
            .read()
            .map_err(|_| LedgerError::Database("ledger map lock poisoned".into()))?
            .get(&id)
            .cloned())
    }

    fn row(&self, id: ProductItemId) -> Result<Row, LedgerError> {
        if let Some(row) = self.existing(id)? {
            return Ok(row);
        }
        let mut rows = self
            .rows
            .write()
            .map_err(|_| LedgerError::Database("ledger map lock poisoned".into()))?;
        Ok(rows.entry(id).or_default().clone())
    }

    /// Lock rows in ascending id order. `ids` must already be sorted.
    async fn lock_sorted(
        &self,
        ids: impl Iterator<Item = ProductItemId>,
    ) -> Result<Vec<OwnedMutexGuard<Option<StockLine>>>, LedgerError> {
        let mut guards = Vec::new();
        for id in ids {
            guards.push(self.row(id)?.lock_owned().await);
        }
        Ok(guards)
    }
}

#[async_trait]
impl StockLedger for InMemoryStockLedger {
    async fn get(&self, product_item_id: ProductItemId) -> Result<Option<StockLine>, LedgerError> {
        match self.existing(product_item_id)? {
            Some(row) => Ok(row.lock().await.clone()),
            None => Ok(None),
        }
    }

    async fn get_many(&self, ids: &[ProductItemId]) -> Result<Vec<StockLine>, LedgerError> {
        let mut sorted = ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut out = Vec::with_capacity(sorted.len());
        for id in sorted {
            if let Some(line) = self.get(id).await? {
                out.push(line);
            }
        }
        Ok(out)
    }

    async fn deduct(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome, LedgerError> {
        let mut guards = self.lock_sorted(lines.iter().map(|l| l.product_item_id)).await?;
        let mut deductions = self.deductions.lock().await;
        if deductions.contains_key(&order_id) {
            return Ok(DeductOutcome::AlreadyApplied);
        }

        let current: Vec<StockLine> = guards.iter().filter_map(|g| g.as_ref().cloned()).collect();
        let updated = apply_deduction(&current, lines, now)?;
        for guard in guards.iter_mut() {
            let next = guard
                .as_ref()
                .and_then(|stock| updated.iter().find(|u| u.product_item_id() == stock.product_item_id()));
            if let Some(next) = next {
                **guard = Some(next.clone());
            }
        }
        deductions.insert(order_id, lines.to_vec());
        Ok(DeductOutcome::Applied(updated))
    }

    async fn find_deduction(
        &self,
        order_id: OrderId,
    ) -> Result<Option<Vec<ReservationLine>>, LedgerError> {
        Ok(self.deductions.lock().await.get(&order_id).cloned())
    }

    async fn override_stock(
        &self,
        product_item_id: ProductItemId,
        new_qty: u64,
        now: DateTime<Utc>,
        guard: &dyn OverrideGuard,
    ) -> Result<StockLine, LedgerError> {
        let row = self.row(product_item_id)?;
        let mut locked = row.lock().await;

        let proposed = match locked.as_ref() {
            Some(current) => current.with_quantity(new_qty, now),
            None => StockLine::new(product_item_id, new_qty, now),
        };
        guard
            .admit(&proposed)
            .await
            .map_err(|e| LedgerError::Rejected(Box::new(e)))?;

        *locked = Some(proposed.clone());
        Ok(proposed)
    }

    async fn register(&self, line: StockLine) -> Result<StockLine, LedgerError> {
        let row = self.row(line.product_item_id())?;
        let mut locked = row.lock().await;
        Ok(locked.get_or_insert(line).clone())
    }

    async fn set_sellable(
        &self,
        product_item_id: ProductItemId,
        sellable: bool,
        now: DateTime<Utc>,
    ) -> Result<StockLine, LedgerError> {
        let row = self.row(product_item_id)?;
        let mut locked = row.lock().await;
        let current = locked
            .as_ref()
            .ok_or(LedgerError::NotFound(product_item_id))?;

        if current.is_sellable() == sellable {
            return Ok(current.clone());
        }
        let next = if sellable {
            current.enable(now)
        } else {
            current.disable(now)
        };
        *locked = Some(next.clone());
        Ok(next)
    }
}
