use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;

use chrono::{Duration, Utc};
use stockhold_core::{OrderId, ProductItemId, SystemClock};
use stockhold_infra::ledger::InMemoryStockLedger;
use stockhold_infra::reservations::{InMemoryReservationStore, ReservationStore};
use stockhold_infra::{EngineConfig, StockService};
use stockhold_inventory::{Reservation, ReservationLine, StockLine};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn service() -> StockService {
    StockService::new(
        Arc::new(InMemoryStockLedger::new()),
        Arc::new(InMemoryReservationStore::default()),
        Arc::new(SystemClock),
        EngineConfig::default(),
    )
}

/// Reserve then release one line: the checkout hot path minus the ledger.
fn bench_reserve_release_cycle(c: &mut Criterion) {
    let rt = runtime();
    let svc = service();
    let sku = ProductItemId::new();
    rt.block_on(svc.register_line(sku, 1_000_000, true)).unwrap();

    let mut group = c.benchmark_group("reserve_release_cycle");
    group.throughput(Throughput::Elements(1));
    group.bench_function("single_line", |b| {
        b.to_async(&rt).iter(|| async {
            let order = OrderId::new();
            let receipt = svc
                .reserve_stock(order, vec![ReservationLine::new(sku, 1)])
                .await
                .unwrap();
            black_box(receipt);
            svc.release_stock(order).await.unwrap();
        });
    });
    group.finish();
}

/// Basket evaluation cost as the number of lines grows.
fn bench_check_stock_basket(c: &mut Criterion) {
    let rt = runtime();
    let svc = service();

    let mut group = c.benchmark_group("check_stock_basket");
    for lines in [1usize, 10, 100].iter() {
        let skus: Vec<ProductItemId> = (0..*lines).map(|_| ProductItemId::new()).collect();
        for sku in &skus {
            rt.block_on(svc.register_line(*sku, 100, true)).unwrap();
        }
        let basket: Vec<ReservationLine> = skus.iter().map(|s| ReservationLine::new(*s, 1)).collect();

        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &basket, |b, basket| {
            b.to_async(&rt)
                .iter(|| async { black_box(svc.check_stock(basket.clone()).await.unwrap()) });
        });
    }
    group.finish();
}

/// Availability with many outstanding holds on the same SKU.
fn bench_levels_under_holds(c: &mut Criterion) {
    let rt = runtime();

    let mut group = c.benchmark_group("levels_under_holds");
    for holds in [10usize, 1_000, 10_000].iter() {
        let store = InMemoryReservationStore::default();
        let sku = ProductItemId::new();
        let now = Utc::now();
        rt.block_on(async {
            store
                .sync_stock(&[StockLine::new(sku, u64::MAX / 2, now)], false)
                .await
                .unwrap();
            for _ in 0..*holds {
                let r = Reservation::new(
                    OrderId::new(),
                    [ReservationLine::new(sku, 1)],
                    now,
                    Duration::minutes(15),
                )
                .unwrap();
                store.reserve(&r, now).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(holds), &sku, |b, sku| {
            b.to_async(&rt)
                .iter(|| async { black_box(store.levels(&[*sku], Utc::now()).await.unwrap()) });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_reserve_release_cycle,
    bench_check_stock_basket,
    bench_levels_under_holds
);
criterion_main!(benches);
