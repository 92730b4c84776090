//! Integration tests for [`PostgresStockLedger`] against a real Postgres.
//!
//! # Running These Tests
//!
//! Marked `#[ignore]` because they need Docker (testcontainers starts a
//! Postgres container per test). To run explicitly:
//! ```bash
//! cargo test -p stockhold-infra --test postgres_ledger -- --ignored
//! ```

#![allow(clippy::expect_used)]

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use stockhold_core::{OrderId, ProductItemId};
use stockhold_infra::ledger::{AdmitAll, DeductOutcome, LedgerError, OverrideGuard, StockLedger};
use stockhold_infra::StockError;
use stockhold_inventory::{ReservationLine, StockLine, StockStatus};

struct RejectBelow(u64);

#[async_trait]
impl OverrideGuard for RejectBelow {
    async fn admit(&self, proposed: &StockLine) -> Result<(), StockError> {
        if proposed.qty_in_stock() < self.0 {
            return Err(StockError::AdminOverrideConflict {
                product_item_id: proposed.product_item_id(),
                requested: proposed.qty_in_stock(),
                reserved: self.0,
            });
        }
        Ok(())
    }
}

async fn seeded(ledger: &dyn StockLedger, qty: u64) -> ProductItemId {
    let id = ProductItemId::new();
    ledger
        .register(StockLine::new(id, qty, Utc::now()))
        .await
        .expect("register");
    id
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn deduct_is_idempotent_and_recorded() {
    let (_pg, ledger) = common::start_postgres().await;
    let id = seeded(&ledger, 5).await;
    let order = OrderId::new();
    let lines = vec![ReservationLine::new(id, 2)];

    match ledger.deduct(order, &lines, Utc::now()).await.expect("deduct") {
        DeductOutcome::Applied(updated) => {
            assert_eq!(updated[0].qty_in_stock(), 3);
            assert_eq!(updated[0].version(), 2);
        }
        other => panic!("expected Applied, got {other:?}"),
    }
    assert_eq!(
        ledger.deduct(order, &lines, Utc::now()).await.expect("replay"),
        DeductOutcome::AlreadyApplied
    );

    assert_eq!(ledger.get(id).await.expect("get").expect("line").qty_in_stock(), 3);
    assert_eq!(ledger.find_deduction(order).await.expect("find"), Some(lines));
    assert_eq!(ledger.find_deduction(OrderId::new()).await.expect("find"), None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn short_line_rolls_back_the_whole_deduction() {
    let (_pg, ledger) = common::start_postgres().await;
    let a = seeded(&ledger, 5).await;
    let b = seeded(&ledger, 1).await;
    let order = OrderId::new();

    // Unsorted on purpose: rows are matched by id.
    let lines = vec![ReservationLine::new(b, 3), ReservationLine::new(a, 2)];
    let err = ledger.deduct(order, &lines, Utc::now()).await.unwrap_err();
    assert!(matches!(err, LedgerError::Insufficient { requested: 3, on_hand: 1, .. }));

    assert_eq!(ledger.get(a).await.expect("get").expect("line").qty_in_stock(), 5);
    assert_eq!(ledger.get(b).await.expect("get").expect("line").qty_in_stock(), 1);
    assert_eq!(ledger.find_deduction(order).await.expect("find"), None);

    let err = ledger
        .deduct(OrderId::new(), &[ReservationLine::new(ProductItemId::new(), 1)], Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn concurrent_deductions_never_drive_stock_negative() {
    let (_pg, ledger) = common::start_postgres().await;
    let ledger: Arc<dyn StockLedger> = Arc::new(ledger);
    let id = seeded(ledger.as_ref(), 5).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        tasks.push(tokio::spawn(async move {
            ledger
                .deduct(OrderId::new(), &[ReservationLine::new(id, 1)], Utc::now())
                .await
        }));
    }

    let mut applied = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(DeductOutcome::Applied(_)) => applied += 1,
            Ok(DeductOutcome::AlreadyApplied) => panic!("orders are distinct"),
            Err(LedgerError::Insufficient { .. } | LedgerError::Concurrency(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    let line = ledger.get(id).await.expect("get").expect("line");
    assert_eq!(line.qty_in_stock(), 5 - applied);
    assert!(applied <= 5);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn override_creates_lines_and_rolls_back_on_rejection() {
    let (_pg, ledger) = common::start_postgres().await;
    let id = ProductItemId::new();

    let created = ledger
        .override_stock(id, 7, Utc::now(), &AdmitAll)
        .await
        .expect("create");
    assert_eq!(created.version(), 1);
    assert_eq!(created.status(), StockStatus::Active);

    let err = ledger
        .override_stock(id, 2, Utc::now(), &RejectBelow(4))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Rejected(_)));
    assert_eq!(ledger.get(id).await.expect("get").expect("line").qty_in_stock(), 7);

    let zeroed = ledger
        .override_stock(id, 0, Utc::now(), &AdmitAll)
        .await
        .expect("zero");
    assert_eq!(zeroed.status(), StockStatus::OutOfStock);
    assert_eq!(zeroed.version(), 2);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn register_keeps_existing_lines_and_sellable_is_sticky() {
    let (_pg, ledger) = common::start_postgres().await;
    let id = seeded(&ledger, 4).await;

    let again = ledger
        .register(StockLine::new(id, 99, Utc::now()))
        .await
        .expect("register");
    assert_eq!(again.qty_in_stock(), 4);

    let disabled = ledger.set_sellable(id, false, Utc::now()).await.expect("disable");
    assert_eq!(disabled.status(), StockStatus::Disabled);
    let unchanged = ledger.set_sellable(id, false, Utc::now()).await.expect("disable twice");
    assert_eq!(unchanged.version(), disabled.version());

    let many = ledger
        .get_many(&[id, ProductItemId::new()])
        .await
        .expect("get_many");
    assert_eq!(many.len(), 1);
    assert!(!many[0].is_sellable());
}
