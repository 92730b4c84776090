//! In-memory reservation store.
//!
//! Lock order: order slot, then SKU slots in ascending id order. All work is
//! synchronous under the locks; nothing is awaited while a guard is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use stockhold_core::{OrderId, ProductItemId};
use stockhold_inventory::{
    evaluate_basket, AbortDecision, ReleaseDecision, ReleaseReason, Reservation, ReservationState,
    StockLevel, StockLine,
};

use super::{
    ConsumeClaim, FinishOutcome, OverrideVerdict, ReleaseOutcome, ReservationStore, ReserveOutcome,
    StoreError,
};

#[derive(Debug, Clone, Copy)]
struct Mirror {
    on_hand: u64,
    version: u64,
    sellable: bool,
}

impl Mirror {
    fn of(line: &StockLine) -> Self {
        Self {
            on_hand: line.qty_in_stock(),
            version: line.version(),
            sellable: line.is_sellable(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Hold {
    quantity: u64,
    /// `None` while a deduction holds the claim.
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SkuSlot {
    mirror: Option<Mirror>,
    reserved: u64,
    holds: HashMap<OrderId, Hold>,
}

impl SkuSlot {
    /// `reserved` minus holds whose window already elapsed.
    fn active_reserved(&self, now: DateTime<Utc>) -> u64 {
        let lapsed: u64 = self
            .holds
            .values()
            .filter(|h| h.expires_at.is_some_and(|at| at <= now))
            .map(|h| h.quantity)
            .sum();
        self.reserved.saturating_sub(lapsed)
    }

    fn level(&self, product_item_id: ProductItemId, now: DateTime<Utc>) -> Option<StockLevel> {
        self.mirror.map(|m| StockLevel {
            product_item_id,
            on_hand: m.on_hand,
            reserved: self.active_reserved(now),
            sellable: m.sellable,
        })
    }

    fn apply(&mut self, line: &StockLine, force: bool) {
        let stale = self
            .mirror
            .is_some_and(|m| m.version >= line.version());
        if force || !stale {
            self.mirror = Some(Mirror::of(line));
        }
    }

    fn add_hold(&mut self, order_id: OrderId, hold: Hold) {
        self.reserved += hold.quantity;
        self.holds.insert(order_id, hold);
    }

    /// Idempotent: only the recorded hold quantity is returned.
    fn drop_hold(&mut self, order_id: OrderId) {
        if let Some(hold) = self.holds.remove(&order_id) {
            self.reserved = self.reserved.saturating_sub(hold.quantity);
        }
    }

    fn set_hold_expiry(&mut self, order_id: OrderId, expires_at: Option<DateTime<Utc>>) {
        if let Some(hold) = self.holds.get_mut(&order_id) {
            hold.expires_at = expires_at;
        }
    }
}

type OrderSlot = Arc<Mutex<Option<Reservation>>>;
type SkuSlots = Vec<(ProductItemId, Arc<Mutex<SkuSlot>>)>;

#[derive(Debug)]
pub struct InMemoryReservationStore {
    skus: RwLock<HashMap<ProductItemId, Arc<Mutex<SkuSlot>>>>,
    orders: RwLock<HashMap<OrderId, OrderSlot>>,
    /// How long terminal records are kept.
    retention: Duration,
}

impl Default for InMemoryReservationStore {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>, StoreError> {
    m.lock().map_err(|_| StoreError::Poisoned(what))
}

impl InMemoryReservationStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            skus: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            retention,
        }
    }

    fn order_slot(&self, order_id: OrderId, create: bool) -> Result<Option<OrderSlot>, StoreError> {
        if let Some(slot) = self
            .orders
            .read()
            .map_err(|_| StoreError::Poisoned("orders"))?
            .get(&order_id)
        {
            return Ok(Some(slot.clone()));
        }
        if !create {
            return Ok(None);
        }
        let mut orders = self.orders.write().map_err(|_| StoreError::Poisoned("orders"))?;
        Ok(Some(orders.entry(order_id).or_default().clone()))
    }

    /// Slots for `ids`, sorted and deduplicated, created when missing.
    fn sku_slots(&self, ids: impl IntoIterator<Item = ProductItemId>) -> Result<SkuSlots, StoreError> {
        let mut ids: Vec<ProductItemId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();

        let mut out = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        {
            let skus = self.skus.read().map_err(|_| StoreError::Poisoned("skus"))?;
            for id in &ids {
                match skus.get(id) {
                    Some(slot) => out.push((*id, slot.clone())),
                    None => missing.push(*id),
                }
            }
        }
        if !missing.is_empty() {
            let mut skus = self.skus.write().map_err(|_| StoreError::Poisoned("skus"))?;
            for id in missing {
                out.push((id, skus.entry(id).or_default().clone()));
            }
            out.sort_by_key(|(id, _)| *id);
        }
        Ok(out)
    }

    fn existing_sku(&self, id: ProductItemId) -> Result<Option<Arc<Mutex<SkuSlot>>>, StoreError> {
        Ok(self
            .skus
            .read()
            .map_err(|_| StoreError::Poisoned("skus"))?
            .get(&id)
            .cloned())
    }

    /// Drop terminal records past retention and empty slots nobody holds.
    fn purge_tombstones(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut candidates = Vec::new();
        {
            let orders = self.orders.read().map_err(|_| StoreError::Poisoned("orders"))?;
            for (order_id, slot) in orders.iter() {
                let record = lock(slot, "order")?;
                let dead = match record.as_ref() {
                    None => true,
                    Some(r) => r
                        .state()
                        .settled_at()
                        .is_some_and(|at| at + self.retention <= now),
                };
                if dead {
                    candidates.push(*order_id);
                }
            }
        }
        if candidates.is_empty() {
            return Ok(());
        }
        let mut orders = self.orders.write().map_err(|_| StoreError::Poisoned("orders"))?;
        for order_id in candidates {
            // A caller that cloned the slot may still be about to fill it.
            if orders.get(&order_id).is_some_and(|s| Arc::strong_count(s) == 1) {
                orders.remove(&order_id);
            }
        }
        Ok(())
    }
}

fn lock_all(slots: &SkuSlots) -> Result<BTreeMap<ProductItemId, MutexGuard<'_, SkuSlot>>, StoreError> {
    let mut guards = BTreeMap::new();
    for (id, slot) in slots {
        guards.insert(*id, lock(slot, "sku")?);
    }
    Ok(guards)
}

fn drop_holds(
    guards: &mut BTreeMap<ProductItemId, MutexGuard<'_, SkuSlot>>,
    record: &Reservation,
) {
    for id in record.product_item_ids() {
        if let Some(slot) = guards.get_mut(&id) {
            slot.drop_hold(record.order_id());
        }
    }
}

fn set_hold_expiry(
    guards: &mut BTreeMap<ProductItemId, MutexGuard<'_, SkuSlot>>,
    record: &Reservation,
    expires_at: Option<DateTime<Utc>>,
) {
    for id in record.product_item_ids() {
        if let Some(slot) = guards.get_mut(&id) {
            slot.set_hold_expiry(record.order_id(), expires_at);
        }
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn sync_stock(&self, lines: &[StockLine], force: bool) -> Result<(), StoreError> {
        let slots = self.sku_slots(lines.iter().map(StockLine::product_item_id))?;
        let mut guards = lock_all(&slots)?;
        for line in lines {
            if let Some(slot) = guards.get_mut(&line.product_item_id()) {
                slot.apply(line, force);
            }
        }
        Ok(())
    }

    async fn levels(
        &self,
        ids: &[ProductItemId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Option<StockLevel>>, StoreError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let level = match self.existing_sku(*id)? {
                Some(slot) => lock(&slot, "sku")?.level(*id, now),
                None => None,
            };
            out.push(level);
        }
        Ok(out)
    }

    async fn reserve(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let order_id = reservation.order_id();
        let Some(order_slot) = self.order_slot(order_id, true)? else {
            return Err(StoreError::Corrupt(format!("order slot for {order_id} vanished")));
        };
        let mut record = lock(&order_slot, "order")?;

        // A lapsed hold of the same order is superseded; its quantities are
        // dropped in the same step as the new ones are added.
        let mut lapsed: Option<Reservation> = None;
        match record.as_ref() {
            Some(existing) if existing.is_active(now) => {
                return Ok(if existing.same_lines(reservation.lines()) {
                    ReserveOutcome::AlreadyReserved(existing.clone())
                } else {
                    ReserveOutcome::Conflict {
                        existing: existing.state(),
                    }
                });
            }
            Some(existing) if matches!(existing.state(), ReservationState::Consumed { .. }) => {
                return Ok(ReserveOutcome::Conflict {
                    existing: existing.state(),
                });
            }
            Some(existing) if existing.is_expired(now) => lapsed = Some(existing.clone()),
            _ => {}
        }

        let slots = self.sku_slots(
            reservation
                .product_item_ids()
                .chain(lapsed.iter().flat_map(|r| r.product_item_ids().collect::<Vec<_>>())),
        )?;
        let mut guards = lock_all(&slots)?;

        let mut levels = Vec::with_capacity(reservation.lines().len());
        let mut unseeded = Vec::new();
        for id in reservation.product_item_ids() {
            match guards.get(&id).and_then(|slot| slot.level(id, now)) {
                Some(level) => levels.push(level),
                None => unseeded.push(id),
            }
        }
        if !unseeded.is_empty() {
            return Ok(ReserveOutcome::Unseeded(unseeded));
        }
        if let Err(short) = evaluate_basket(&levels, reservation.lines()) {
            return Ok(ReserveOutcome::Insufficient(short));
        }

        if let Some(old) = &lapsed {
            drop_holds(&mut guards, old);
        }
        for line in reservation.lines() {
            if let Some(slot) = guards.get_mut(&line.product_item_id) {
                slot.add_hold(
                    order_id,
                    Hold {
                        quantity: line.quantity,
                        expires_at: Some(reservation.expires_at()),
                    },
                );
            }
        }
        *record = Some(reservation.clone());
        Ok(ReserveOutcome::Reserved(reservation.clone()))
    }

    async fn admit_override(
        &self,
        proposed: &StockLine,
        now: DateTime<Utc>,
    ) -> Result<OverrideVerdict, StoreError> {
        let slots = self.sku_slots([proposed.product_item_id()])?;
        let mut guards = lock_all(&slots)?;
        let Some(slot) = guards.get_mut(&proposed.product_item_id()) else {
            return Err(StoreError::Corrupt("sku slot vanished".into()));
        };

        let reserved = slot.active_reserved(now);
        if proposed.qty_in_stock() < reserved {
            return Ok(OverrideVerdict::Conflict { reserved });
        }
        slot.apply(proposed, true);
        Ok(OverrideVerdict::Admitted { reserved })
    }

    async fn find(&self, order_id: OrderId) -> Result<Option<Reservation>, StoreError> {
        match self.order_slot(order_id, false)? {
            Some(slot) => Ok(lock(&slot, "order")?.clone()),
            None => Ok(None),
        }
    }

    async fn begin_consume(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<ConsumeClaim, StoreError> {
        let Some(order_slot) = self.order_slot(order_id, false)? else {
            return Ok(ConsumeClaim::NotFound);
        };
        let mut record = lock(&order_slot, "order")?;
        let Some(current) = record.as_mut() else {
            return Ok(ConsumeClaim::NotFound);
        };

        match current.state() {
            ReservationState::Consumed { .. } => return Ok(ConsumeClaim::AlreadyConsumed(current.clone())),
            ReservationState::Released { .. } => return Ok(ConsumeClaim::Released(current.clone())),
            ReservationState::Consuming { .. } => return Ok(ConsumeClaim::InProgress),
            ReservationState::Held if current.is_expired(now) => return Ok(ConsumeClaim::Expired),
            ReservationState::Held => {}
        }

        let slots = self.sku_slots(current.product_item_ids())?;
        let mut guards = lock_all(&slots)?;
        current
            .claim(now)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        set_hold_expiry(&mut guards, current, None);
        Ok(ConsumeClaim::Claimed(current.clone()))
    }

    async fn finish_consume(
        &self,
        order_id: OrderId,
        synced: &[StockLine],
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, StoreError> {
        let Some(order_slot) = self.order_slot(order_id, false)? else {
            return Ok(FinishOutcome::Orphaned);
        };
        let mut record = lock(&order_slot, "order")?;
        let Some(current) = record.as_mut() else {
            return Ok(FinishOutcome::Orphaned);
        };

        match current.state() {
            ReservationState::Consumed { .. } => return Ok(FinishOutcome::AlreadyConsumed(current.clone())),
            ReservationState::Released { .. } => return Ok(FinishOutcome::Orphaned),
            ReservationState::Held | ReservationState::Consuming { .. } => {}
        }

        let slots = self.sku_slots(
            current
                .product_item_ids()
                .chain(synced.iter().map(StockLine::product_item_id)),
        )?;
        let mut guards = lock_all(&slots)?;
        drop_holds(&mut guards, current);
        for line in synced {
            if let Some(slot) = guards.get_mut(&line.product_item_id()) {
                slot.apply(line, false);
            }
        }
        current
            .consume(now)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(FinishOutcome::Consumed(current.clone()))
    }

    async fn abort_consume(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<AbortDecision, StoreError> {
        let Some(order_slot) = self.order_slot(order_id, false)? else {
            return Ok(AbortDecision::NotClaimed);
        };
        let mut record = lock(&order_slot, "order")?;
        let Some(current) = record.as_mut() else {
            return Ok(AbortDecision::NotClaimed);
        };
        if !matches!(current.state(), ReservationState::Consuming { .. }) {
            return Ok(AbortDecision::NotClaimed);
        }

        let slots = self.sku_slots(current.product_item_ids())?;
        let mut guards = lock_all(&slots)?;
        let decision = current.abort_claim(now);
        match decision {
            AbortDecision::Restored => {
                let expires_at = current.expires_at();
                set_hold_expiry(&mut guards, current, Some(expires_at));
            }
            AbortDecision::Released(_) => drop_holds(&mut guards, current),
            AbortDecision::NotClaimed => {}
        }
        Ok(decision)
    }

    async fn release(
        &self,
        order_id: OrderId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, StoreError> {
        let Some(order_slot) = self.order_slot(order_id, false)? else {
            return Ok(ReleaseOutcome::NotFound);
        };
        let mut record = lock(&order_slot, "order")?;
        let Some(current) = record.as_mut() else {
            return Ok(ReleaseOutcome::NotFound);
        };

        let slots = self.sku_slots(current.product_item_ids())?;
        let mut guards = lock_all(&slots)?;
        Ok(match current.release(reason, now) {
            ReleaseDecision::Released => {
                drop_holds(&mut guards, current);
                ReleaseOutcome::Released(current.clone())
            }
            ReleaseDecision::Deferred => ReleaseOutcome::Deferred(current.clone()),
            ReleaseDecision::Busy => ReleaseOutcome::Busy,
            ReleaseDecision::NotDue => ReleaseOutcome::NotDue,
            ReleaseDecision::AlreadyTerminal => ReleaseOutcome::AlreadyTerminal(current.clone()),
        })
    }

    /// Also purges tombstones past retention.
    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>, StoreError> {
        self.purge_tombstones(now)?;

        let mut due = Vec::new();
        {
            let orders = self.orders.read().map_err(|_| StoreError::Poisoned("orders"))?;
            for slot in orders.values() {
                if let Some(r) = lock(slot, "order")?.as_ref() {
                    if r.is_expired(now) {
                        due.push((r.expires_at(), r.order_id()));
                    }
                }
            }
        }
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn stalled_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderId>, StoreError> {
        let mut stalled = Vec::new();
        {
            let orders = self.orders.read().map_err(|_| StoreError::Poisoned("orders"))?;
            for slot in orders.values() {
                if let Some(r) = lock(slot, "order")?.as_ref() {
                    if let ReservationState::Consuming { claimed_at } = r.state() {
                        if claimed_at <= claimed_before {
                            stalled.push((claimed_at, r.order_id()));
                        }
                    }
                }
            }
        }
        stalled.sort();
        Ok(stalled.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockhold_inventory::ReservationLine;

    fn window() -> Duration {
        Duration::minutes(15)
    }

    async fn seeded(qty: u64) -> (InMemoryReservationStore, ProductItemId, DateTime<Utc>) {
        let store = InMemoryReservationStore::default();
        let id = ProductItemId::new();
        let now = Utc::now();
        store
            .sync_stock(&[StockLine::new(id, qty, now)], false)
            .await
            .unwrap();
        (store, id, now)
    }

    fn hold(id: ProductItemId, qty: u64, now: DateTime<Utc>) -> Reservation {
        Reservation::new(OrderId::new(), vec![ReservationLine::new(id, qty)], now, window()).unwrap()
    }

    async fn available(store: &InMemoryReservationStore, id: ProductItemId, now: DateTime<Utc>) -> u64 {
        store.levels(&[id], now).await.unwrap()[0].unwrap().available()
    }

    #[tokio::test]
    async fn reserve_unknown_sku_asks_for_seed() {
        let store = InMemoryReservationStore::default();
        let id = ProductItemId::new();
        let outcome = store.reserve(&hold(id, 1, Utc::now()), Utc::now()).await.unwrap();
        assert_eq!(outcome, ReserveOutcome::Unseeded(vec![id]));
    }

    #[tokio::test]
    async fn reserve_is_idempotent_for_same_lines() {
        let (store, id, now) = seeded(5).await;
        let r = hold(id, 2, now);

        assert!(matches!(store.reserve(&r, now).await.unwrap(), ReserveOutcome::Reserved(_)));
        assert!(matches!(
            store.reserve(&r, now).await.unwrap(),
            ReserveOutcome::AlreadyReserved(_)
        ));
        assert_eq!(available(&store, id, now).await, 3);

        let different = Reservation::restore(
            r.order_id(),
            vec![ReservationLine::new(id, 1)],
            now,
            now + window(),
            ReservationState::Held,
            false,
        );
        assert!(matches!(
            store.reserve(&different, now).await.unwrap(),
            ReserveOutcome::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn insufficient_basket_reserves_nothing() {
        let (store, a, now) = seeded(5).await;
        let b = ProductItemId::new();
        store.sync_stock(&[StockLine::new(b, 1, now)], false).await.unwrap();

        let r = Reservation::new(
            OrderId::new(),
            vec![ReservationLine::new(a, 2), ReservationLine::new(b, 2)],
            now,
            window(),
        )
        .unwrap();
        match store.reserve(&r, now).await.unwrap() {
            ReserveOutcome::Insufficient(short) => {
                assert_eq!(short.len(), 1);
                assert_eq!(short[0].product_item_id, b);
            }
            other => panic!("expected Insufficient, got {other:?}"),
        }
        assert_eq!(available(&store, a, now).await, 5);
        assert_eq!(store.find(r.order_id()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn lapsed_hold_stops_counting_before_release() {
        let (store, id, now) = seeded(2).await;
        let r = hold(id, 2, now);
        store.reserve(&r, now).await.unwrap();
        assert_eq!(available(&store, id, now).await, 0);

        let later = now + window();
        assert_eq!(available(&store, id, later).await, 2);
        assert_eq!(store.due_for_expiry(later, 10).await.unwrap(), vec![r.order_id()]);

        let released = store.release(r.order_id(), ReleaseReason::Expired, later).await.unwrap();
        assert!(matches!(released, ReleaseOutcome::Released(_)));
        let again = store.release(r.order_id(), ReleaseReason::Expired, later).await.unwrap();
        assert!(matches!(again, ReleaseOutcome::AlreadyTerminal(_)));
        assert_eq!(available(&store, id, later).await, 2);
    }

    #[tokio::test]
    async fn claimed_hold_survives_its_window() {
        let (store, id, now) = seeded(2).await;
        let r = hold(id, 2, now);
        store.reserve(&r, now).await.unwrap();
        assert!(matches!(
            store.begin_consume(r.order_id(), now).await.unwrap(),
            ConsumeClaim::Claimed(_)
        ));

        let later = now + window() + Duration::minutes(1);
        assert_eq!(available(&store, id, later).await, 0);
        assert!(store.due_for_expiry(later, 10).await.unwrap().is_empty());
        assert_eq!(
            store.release(r.order_id(), ReleaseReason::Expired, later).await.unwrap(),
            ReleaseOutcome::Busy
        );
    }

    #[tokio::test]
    async fn finish_consume_moves_quantity_from_reserved_to_ledger() {
        let (store, id, now) = seeded(5).await;
        let r = hold(id, 2, now);
        store.reserve(&r, now).await.unwrap();
        store.begin_consume(r.order_id(), now).await.unwrap();

        let after = StockLine::new(id, 5, now).deduct(2, now).unwrap();
        let outcome = store.finish_consume(r.order_id(), &[after], now).await.unwrap();
        assert!(matches!(outcome, FinishOutcome::Consumed(_)));

        let level = store.levels(&[id], now).await.unwrap()[0].unwrap();
        assert_eq!((level.on_hand, level.reserved), (3, 0));
        assert!(matches!(
            store.finish_consume(r.order_id(), &[], now).await.unwrap(),
            FinishOutcome::AlreadyConsumed(_)
        ));
    }

    #[tokio::test]
    async fn cancel_during_claim_releases_on_abort() {
        let (store, id, now) = seeded(5).await;
        let r = hold(id, 2, now);
        store.reserve(&r, now).await.unwrap();
        store.begin_consume(r.order_id(), now).await.unwrap();

        assert!(matches!(
            store.release(r.order_id(), ReleaseReason::Cancelled, now).await.unwrap(),
            ReleaseOutcome::Deferred(_)
        ));
        assert_eq!(available(&store, id, now).await, 3);

        assert_eq!(
            store.abort_consume(r.order_id(), now).await.unwrap(),
            AbortDecision::Released(ReleaseReason::Cancelled)
        );
        assert_eq!(available(&store, id, now).await, 5);
    }

    #[tokio::test]
    async fn override_below_reserved_is_refused() {
        let (store, id, now) = seeded(5).await;
        store.reserve(&hold(id, 4, now), now).await.unwrap();

        let current = StockLine::new(id, 5, now);
        let verdict = store
            .admit_override(&current.with_quantity(3, now), now)
            .await
            .unwrap();
        assert_eq!(verdict, OverrideVerdict::Conflict { reserved: 4 });
        assert_eq!(available(&store, id, now).await, 1);

        let verdict = store
            .admit_override(&current.with_quantity(10, now), now)
            .await
            .unwrap();
        assert_eq!(verdict, OverrideVerdict::Admitted { reserved: 4 });
        assert_eq!(available(&store, id, now).await, 6);
    }

    #[tokio::test]
    async fn stale_mirror_updates_are_ignored() {
        let (store, id, now) = seeded(5).await;
        let v1 = StockLine::new(id, 5, now);
        let v2 = v1.with_quantity(8, now);
        store.sync_stock(&[v2], false).await.unwrap();
        store.sync_stock(&[v1.clone()], false).await.unwrap();
        assert_eq!(available(&store, id, now).await, 8);

        store.sync_stock(&[v1], true).await.unwrap();
        assert_eq!(available(&store, id, now).await, 5);
    }

    #[tokio::test]
    async fn tombstones_are_purged_after_retention() {
        let store = InMemoryReservationStore::new(Duration::hours(1));
        let id = ProductItemId::new();
        let now = Utc::now();
        store.sync_stock(&[StockLine::new(id, 5, now)], false).await.unwrap();
        let r = hold(id, 1, now);
        store.reserve(&r, now).await.unwrap();
        store.release(r.order_id(), ReleaseReason::Cancelled, now).await.unwrap();

        store.due_for_expiry(now + Duration::minutes(30), 10).await.unwrap();
        assert!(store.find(r.order_id()).await.unwrap().is_some());

        store.due_for_expiry(now + Duration::hours(2), 10).await.unwrap();
        assert!(store.find(r.order_id()).await.unwrap().is_none());
    }
}
