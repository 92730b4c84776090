//! Integration tests for the scripted Redis reservation store, alone and
//! composed with the Postgres ledger behind [`StockService`].
//!
//! # Running These Tests
//!
//! Marked `#[ignore]` because they need Docker (testcontainers starts Redis
//! and Postgres). To run explicitly:
//! ```bash
//! cargo test -p stockhold-infra --features redis --test redis_backend -- --ignored
//! ```

#![allow(clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::Redis;

use stockhold_core::{ManualClock, OrderId, ProductItemId};
use stockhold_infra::ledger::{PostgresStockLedger, StockLedger};
use stockhold_infra::reservations::{
    ConsumeClaim, FinishOutcome, InMemoryReservationStore, RedisReservationStore, ReleaseOutcome,
    ReservationStore, ReserveOutcome,
};
use stockhold_infra::{EngineConfig, ReleaseStatus, StockError, StockService};
use stockhold_inventory::{ReleaseReason, Reservation, ReservationLine, StockLine};

fn reserve_label(outcome: &ReserveOutcome) -> String {
    match outcome {
        ReserveOutcome::Reserved(_) => "reserved".into(),
        ReserveOutcome::AlreadyReserved(_) => "already_reserved".into(),
        ReserveOutcome::Insufficient(short) => format!(
            "insufficient {:?}",
            short.iter().map(|s| (s.requested, s.available)).collect::<Vec<_>>()
        ),
        ReserveOutcome::Unseeded(ids) => format!("unseeded {}", ids.len()),
        ReserveOutcome::Conflict { existing } => format!("conflict {}", existing.label()),
    }
}

fn claim_label(claim: &ConsumeClaim) -> String {
    match claim {
        ConsumeClaim::Claimed(_) => "claimed".into(),
        ConsumeClaim::AlreadyConsumed(_) => "already_consumed".into(),
        ConsumeClaim::InProgress => "in_progress".into(),
        ConsumeClaim::Expired => "expired".into(),
        ConsumeClaim::Released(r) => format!("released {}", r.state().label()),
        ConsumeClaim::NotFound => "not_found".into(),
    }
}

fn finish_label(outcome: &FinishOutcome) -> String {
    match outcome {
        FinishOutcome::Consumed(_) => "consumed".into(),
        FinishOutcome::AlreadyConsumed(_) => "already_consumed".into(),
        FinishOutcome::Orphaned => "orphaned".into(),
    }
}

fn release_label(outcome: &ReleaseOutcome) -> String {
    match outcome {
        ReleaseOutcome::Released(r) => format!("released {}", r.lines().len()),
        ReleaseOutcome::Deferred(_) => "deferred".into(),
        ReleaseOutcome::Busy => "busy".into(),
        ReleaseOutcome::NotDue => "not_due".into(),
        ReleaseOutcome::AlreadyTerminal(r) => format!("terminal {}", r.state().label()),
        ReleaseOutcome::NotFound => "not_found".into(),
    }
}

async fn levels_label(store: &dyn ReservationStore, ids: &[ProductItemId], now: DateTime<Utc>) -> String {
    let levels = store.levels(ids, now).await.expect("levels");
    format!(
        "levels {:?}",
        levels
            .iter()
            .map(|l| l.map(|l| (l.on_hand, l.reserved, l.sellable)))
            .collect::<Vec<_>>()
    )
}

fn hold(order: OrderId, lines: &[(ProductItemId, u64)], now: DateTime<Utc>) -> Reservation {
    Reservation::new(
        order,
        lines.iter().map(|(id, q)| ReservationLine::new(*id, *q)),
        now,
        Duration::minutes(15),
    )
    .expect("valid reservation")
}

/// Fixed ids so two stores can replay the exact same sequence.
struct Script {
    a: ProductItemId,
    b: ProductItemId,
    unseeded: ProductItemId,
    orders: [OrderId; 6],
    now: DateTime<Utc>,
}

impl Script {
    fn new() -> Self {
        Self {
            a: ProductItemId::new(),
            b: ProductItemId::new(),
            unseeded: ProductItemId::new(),
            orders: std::array::from_fn(|_| OrderId::new()),
            now: Utc::now(),
        }
    }

    /// Drive every store operation and record what each returned.
    async fn run(&self, store: &dyn ReservationStore) -> Vec<String> {
        let Script { a, b, unseeded, orders, now } = self;
        let (a, b, now) = (*a, *b, *now);
        let [o1, o2, o3, o4, o5, o6] = *orders;
        let ids = [a, b];
        let mut out = Vec::new();

        let line_a = StockLine::new(a, 5, now);
        let line_b = StockLine::new(b, 2, now);
        store.sync_stock(&[line_a.clone(), line_b.clone()], false).await.expect("sync");
        out.push(levels_label(store, &ids, now).await);

        // Stale snapshots never move the mirror back.
        let newer_a = line_a.with_quantity(6, now);
        store.sync_stock(&[newer_a.clone()], false).await.expect("sync");
        store.sync_stock(&[line_a.clone()], false).await.expect("sync");
        out.push(levels_label(store, &ids, now).await);

        let basket = hold(o1, &[(a, 3), (b, 1)], now);
        let reserve = |r: Reservation| async move { store.reserve(&r, now).await.expect("reserve") };
        out.push(reserve_label(&reserve(basket.clone()).await));
        out.push(reserve_label(&reserve(basket.clone()).await));
        out.push(reserve_label(&reserve(hold(o1, &[(a, 1)], now)).await));
        out.push(reserve_label(&reserve(hold(o2, &[(a, 2), (b, 5)], now)).await));
        out.push(reserve_label(&reserve(hold(o2, &[(*unseeded, 1)], now)).await));
        out.push(levels_label(store, &ids, now).await);

        // Cancel while a deduction owns the claim, then the claim aborts.
        out.push(claim_label(&store.begin_consume(o1, now).await.expect("claim")));
        out.push(claim_label(&store.begin_consume(o1, now).await.expect("claim")));
        out.push(release_label(
            &store.release(o1, ReleaseReason::Cancelled, now).await.expect("release"),
        ));
        out.push(format!("{:?}", store.abort_consume(o1, now).await.expect("abort")));
        out.push(levels_label(store, &ids, now).await);

        // Override checks count active holds only.
        out.push(reserve_label(&reserve(hold(o3, &[(a, 4)], now)).await));
        out.push(format!(
            "{:?}",
            store.admit_override(&newer_a.with_quantity(3, now), now).await.expect("override")
        ));
        let restocked = newer_a.with_quantity(8, now);
        out.push(format!(
            "{:?}",
            store.admit_override(&restocked, now).await.expect("override")
        ));

        // Claim, deduct in the ledger, finish.
        out.push(claim_label(&store.begin_consume(o3, now).await.expect("claim")));
        let deducted = restocked.deduct(4, now).expect("deduct");
        out.push(finish_label(
            &store.finish_consume(o3, &[deducted], now).await.expect("finish"),
        ));
        out.push(finish_label(
            &store.finish_consume(o3, &[], now).await.expect("finish"),
        ));
        out.push(claim_label(&store.begin_consume(o3, now).await.expect("claim")));
        out.push(release_label(
            &store.release(o3, ReleaseReason::Cancelled, now).await.expect("release"),
        ));
        out.push(levels_label(store, &ids, now).await);

        // Lapsed holds stop counting before any sweep.
        out.push(reserve_label(&reserve(hold(o4, &[(b, 2)], now)).await));
        let later = now + Duration::minutes(16);
        out.push(levels_label(store, &ids, later).await);
        out.push(release_label(
            &store.release(o4, ReleaseReason::Expired, now).await.expect("release"),
        ));
        out.push(format!(
            "due {}",
            store.due_for_expiry(later, 10).await.expect("due") == vec![o4]
        ));
        out.push(claim_label(&store.begin_consume(o4, later).await.expect("claim")));
        out.push(release_label(
            &store.release(o4, ReleaseReason::Expired, later).await.expect("release"),
        ));
        out.push(levels_label(store, &ids, later).await);

        // Stalled claims are listed by claim time.
        out.push(reserve_label(&reserve(hold(o5, &[(b, 1)], now)).await));
        out.push(claim_label(&store.begin_consume(o5, now).await.expect("claim")));
        let stalled = store
            .stalled_claims(now + Duration::minutes(3), 10)
            .await
            .expect("stalled");
        out.push(format!("stalled {}", stalled == vec![o5]));

        out.push(claim_label(&store.begin_consume(o6, now).await.expect("claim")));
        out.push(release_label(
            &store.release(o6, ReleaseReason::Cancelled, now).await.expect("release"),
        ));
        out.push(format!("found {}", store.find(o1).await.expect("find").is_some()));
        out
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn scripted_store_matches_the_in_memory_store_step_for_step() {
    let (_redis, url) = common::start_redis().await;
    let redis = common::redis_store(&url).await;
    let memory = InMemoryReservationStore::default();
    let script = Script::new();

    let expected = script.run(&memory).await;
    let actual = script.run(&redis).await;
    for (step, (want, got)) in expected.iter().zip(&actual).enumerate() {
        assert_eq!(want, got, "step {step} diverged");
    }
    assert_eq!(expected.len(), actual.len());
}

struct Backends {
    _postgres: ContainerAsync<Postgres>,
    _redis: ContainerAsync<Redis>,
    service: StockService,
    ledger: Arc<PostgresStockLedger>,
    clock: Arc<ManualClock>,
}

async fn backends() -> Backends {
    let (postgres, ledger) = common::start_postgres().await;
    let (redis, url) = common::start_redis().await;
    let store = Arc::new(common::redis_store(&url).await);
    let ledger = Arc::new(ledger);
    let clock = Arc::new(ManualClock::starting_now());
    let mut config = EngineConfig::default();
    config.retry.base_backoff = StdDuration::from_millis(5);
    let service = StockService::new(ledger.clone(), store, clock.clone(), config);
    Backends {
        _postgres: postgres,
        _redis: redis,
        service,
        ledger,
        clock,
    }
}

fn one(sku: ProductItemId, quantity: u64) -> Vec<ReservationLine> {
    vec![ReservationLine::new(sku, quantity)]
}

async fn available(b: &Backends, sku: ProductItemId) -> u64 {
    b.service.check_stock(one(sku, 1)).await.expect("check")[0].available
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires Docker"]
async fn last_units_go_to_exactly_as_many_reservers_as_fit() {
    let b = Arc::new(backends().await);
    let sku = ProductItemId::new();
    b.service.register_line(sku, 3, true).await.expect("register");

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let b = b.clone();
        tasks.push(tokio::spawn(async move {
            b.service.reserve_stock(OrderId::new(), one(sku, 1)).await
        }));
    }

    let mut won = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(_) => won += 1,
            Err(StockError::InsufficientStock { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 3);
    assert_eq!(available(&b, sku).await, 0);
    assert_eq!(b.service.get_stock(sku).await.expect("get").qty_in_stock(), 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn short_basket_reserves_nothing() {
    let b = backends().await;
    let x = ProductItemId::new();
    let y = ProductItemId::new();
    b.service.register_line(x, 10, true).await.expect("register");
    b.service.register_line(y, 1, true).await.expect("register");

    let err = b
        .service
        .reserve_stock(
            OrderId::new(),
            vec![ReservationLine::new(x, 2), ReservationLine::new(y, 2)],
        )
        .await
        .unwrap_err();
    match err {
        StockError::InsufficientStock { lines } => {
            assert_eq!(lines.len(), 1);
            assert_eq!(lines[0].product_item_id, y);
        }
        other => panic!("expected InsufficientStock, got {other}"),
    }
    assert_eq!(available(&b, x).await, 10);
    assert_eq!(available(&b, y).await, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn lapsed_hold_frees_stock_and_the_sweeper_releases_it() {
    let b = backends().await;
    let sku = ProductItemId::new();
    b.service.register_line(sku, 5, true).await.expect("register");
    let order = OrderId::new();
    b.service.reserve_stock(order, one(sku, 2)).await.expect("reserve");
    assert_eq!(available(&b, sku).await, 3);

    b.clock.advance(Duration::minutes(16));
    assert_eq!(available(&b, sku).await, 5);

    let report = b.service.sweeper().sweep_once().await.expect("sweep");
    assert_eq!(report.released, 1);
    assert!(matches!(
        b.service.deduct_stock(order).await.unwrap_err(),
        StockError::ReservationExpired(_)
    ));
    assert_eq!(available(&b, sku).await, 5);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn deduct_and_release_are_idempotent() {
    let b = backends().await;
    let sku = ProductItemId::new();
    b.service.register_line(sku, 5, true).await.expect("register");
    let order = OrderId::new();
    b.service.reserve_stock(order, one(sku, 2)).await.expect("reserve");

    let first = b.service.deduct_stock(order).await.expect("deduct");
    assert!(!first.replayed);
    assert_eq!(first.lines[0].qty_in_stock(), 3);

    let again = b.service.deduct_stock(order).await.expect("replay");
    assert!(again.replayed);
    assert_eq!(b.service.release_stock(order).await.expect("release"), ReleaseStatus::AlreadyTerminal);

    assert_eq!(b.service.get_stock(sku).await.expect("get").qty_in_stock(), 3);
    assert_eq!(available(&b, sku).await, 3);
    assert!(b.ledger.find_deduction(order).await.expect("find").is_some());

    let cancelled = OrderId::new();
    b.service.reserve_stock(cancelled, one(sku, 1)).await.expect("reserve");
    assert_eq!(b.service.release_stock(cancelled).await.expect("release"), ReleaseStatus::Released);
    assert_eq!(
        b.service.release_stock(cancelled).await.expect("release"),
        ReleaseStatus::AlreadyTerminal
    );
    assert_eq!(available(&b, sku).await, 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn update_below_reserved_is_rejected() {
    let b = backends().await;
    let sku = ProductItemId::new();
    b.service.register_line(sku, 5, true).await.expect("register");
    b.service.reserve_stock(OrderId::new(), one(sku, 4)).await.expect("reserve");

    let err = b.service.update_stock(sku, 3).await.unwrap_err();
    assert!(matches!(
        err,
        StockError::AdminOverrideConflict { requested: 3, reserved: 4, .. }
    ));
    assert_eq!(b.service.get_stock(sku).await.expect("get").qty_in_stock(), 5);

    b.service.update_stock(sku, 9).await.expect("restock");
    assert_eq!(available(&b, sku).await, 5);
}
