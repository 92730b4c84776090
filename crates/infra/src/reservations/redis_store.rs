//! Redis-backed reservation store.
//!
//! Every state change is one Lua script, so the check-and-increment across all
//! lines of a basket is atomic on the server. Keys (all under one hash tag so
//! a script never crosses slots):
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `{p}:sku:<id>` | hash | `on_hand`, `version`, `sellable`, `reserved` |
//! | `{p}:sku:<id>:holds` | hash | order id → held quantity |
//! | `{p}:sku:<id>:expiry` | zset | order id → `expires_at` ms (`+inf` while claimed) |
//! | `{p}:order:<id>` | hash | reservation record |
//! | `{p}:due` | zset | held orders by `expires_at` |
//! | `{p}:consuming` | zset | claimed orders by `claimed_at` |
//! | `{p}:ttl:<id>` | string | shadow key expiring at `expires_at` |
//!
//! The shadow key's keyspace `expired` event feeds the sweeper (see
//! [`RedisExpiryListener`](super::RedisExpiryListener)). Its expiry alone never
//! changes a counter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::instrument;

use stockhold_core::{OrderId, ProductItemId};
use stockhold_inventory::{
    AbortDecision, ReleaseReason, Reservation, ReservationLine, ReservationState, ShortLine,
    StockLevel, StockLine,
};

use super::{
    ConsumeClaim, FinishOutcome, OverrideVerdict, ReleaseOutcome, ReservationStore, ReserveOutcome,
    StoreError,
};

const COMMON: &str = include_str!("scripts/common.lua");

/// Largest quantity that survives Lua's double arithmetic unchanged.
const MAX_SCRIPT_QUANTITY: u64 = (1 << 53) - 1;

pub const DEFAULT_KEY_PREFIX: &str = "{stockhold}";

struct Scripts {
    reserve: Script,
    levels: Script,
    sync: Script,
    admit_override: Script,
    begin_consume: Script,
    finish_consume: Script,
    abort_consume: Script,
    release: Script,
}

impl Scripts {
    fn load() -> Self {
        let with_prelude = |body: &str| Script::new(&format!("{COMMON}\n{body}"));
        Self {
            reserve: with_prelude(include_str!("scripts/reserve.lua")),
            levels: with_prelude(include_str!("scripts/levels.lua")),
            sync: with_prelude(include_str!("scripts/sync.lua")),
            admit_override: with_prelude(include_str!("scripts/override.lua")),
            begin_consume: with_prelude(include_str!("scripts/begin_consume.lua")),
            finish_consume: with_prelude(include_str!("scripts/finish_consume.lua")),
            abort_consume: with_prelude(include_str!("scripts/abort_consume.lua")),
            release: with_prelude(include_str!("scripts/release.lua")),
        }
    }
}

#[derive(Clone)]
pub struct RedisReservationStore {
    conn: ConnectionManager,
    prefix: String,
    retention_ms: i64,
    scripts: Arc<Scripts>,
}

impl std::fmt::Debug for RedisReservationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisReservationStore")
            .field("prefix", &self.prefix)
            .field("retention_ms", &self.retention_ms)
            .finish_non_exhaustive()
    }
}

impl RedisReservationStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, retention: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            retention_ms: retention.num_milliseconds().max(1),
            scripts: Arc::new(Scripts::load()),
        }
    }

    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        retention: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self::new(conn, prefix, retention))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix of the per-order shadow keys whose expiry signals a due hold.
    pub fn ttl_key_prefix(&self) -> String {
        format!("{}:ttl:", self.prefix)
    }

    fn order_key(&self, order_id: OrderId) -> String {
        format!("{}:order:{}", self.prefix, order_id)
    }

    fn due_key(&self) -> String {
        format!("{}:due", self.prefix)
    }

    fn consuming_key(&self) -> String {
        format!("{}:consuming", self.prefix)
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn corrupt(what: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(what.to_string())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    let ms: i64 = raw.parse().map_err(|_| corrupt(format!("bad timestamp {raw:?}")))?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt(format!("timestamp out of range: {ms}")))
}

fn parse_u64(raw: &str) -> Result<u64, StoreError> {
    raw.parse().map_err(|_| corrupt(format!("bad integer {raw:?}")))
}

/// Canonical JSON for a normalized basket: `[["<sku>", qty], ...]`.
fn encode_lines(lines: &[ReservationLine]) -> Result<String, StoreError> {
    if let Some(line) = lines.iter().find(|l| l.quantity > MAX_SCRIPT_QUANTITY) {
        return Err(StoreError::Backend(format!(
            "quantity {} for {} exceeds the store's range",
            line.quantity, line.product_item_id
        )));
    }
    let pairs: Vec<(String, u64)> = lines
        .iter()
        .map(|l| (l.product_item_id.to_string(), l.quantity))
        .collect();
    serde_json::to_string(&pairs).map_err(corrupt)
}

fn decode_lines(raw: &str) -> Result<Vec<ReservationLine>, StoreError> {
    let pairs: Vec<(ProductItemId, u64)> = serde_json::from_str(raw).map_err(corrupt)?;
    Ok(pairs
        .into_iter()
        .map(|(id, qty)| ReservationLine::new(id, qty))
        .collect())
}

/// Rebuild a reservation from its order hash.
fn decode_reservation(fields: &HashMap<String, String>) -> Result<Reservation, StoreError> {
    let get = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| corrupt(format!("order hash missing {name}")))
    };

    let order_id: OrderId = get("order_id")?.parse().map_err(corrupt)?;
    let lines = decode_lines(get("lines")?)?;
    let created_at = from_millis(get("created_at")?)?;
    let expires_at = from_millis(get("expires_at")?)?;
    let state = match get("state")? {
        "held" => ReservationState::Held,
        "consuming" => ReservationState::Consuming {
            claimed_at: from_millis(get("claimed_at")?)?,
        },
        "consumed" => ReservationState::Consumed {
            at: from_millis(get("settled_at")?)?,
        },
        "released" => ReservationState::Released {
            at: from_millis(get("settled_at")?)?,
            reason: ReleaseReason::parse(get("reason")?).map_err(corrupt)?,
        },
        other => return Err(corrupt(format!("unknown reservation state {other:?}"))),
    };
    let cancel_requested = fields.get("cancel_requested").is_some_and(|v| v == "1");

    Ok(Reservation::restore(
        order_id,
        lines,
        created_at,
        expires_at,
        state,
        cancel_requested,
    ))
}

/// Script reply: a status code followed by the flattened order hash, if any.
struct Reply {
    code: String,
    rest: Vec<String>,
}

impl Reply {
    fn parse(raw: Vec<String>) -> Result<Self, StoreError> {
        let mut it = raw.into_iter();
        let code = it.next().ok_or_else(|| corrupt("empty script reply"))?;
        Ok(Self {
            code,
            rest: it.collect(),
        })
    }

    fn record(&self) -> Result<Reservation, StoreError> {
        if self.rest.len() % 2 != 0 {
            return Err(corrupt("odd-length order hash"));
        }
        let fields: HashMap<String, String> = self
            .rest
            .chunks_exact(2)
            .map(|kv| (kv[0].clone(), kv[1].clone()))
            .collect();
        decode_reservation(&fields)
    }

    fn unexpected(&self, script: &str) -> StoreError {
        corrupt(format!("{script} script replied {:?}", self.code))
    }
}

fn push_snapshot(invocation: &mut redis::ScriptInvocation<'_>, line: &StockLine) {
    invocation
        .arg(line.product_item_id().to_string())
        .arg(line.qty_in_stock())
        .arg(line.version())
        .arg(if line.is_sellable() { "1" } else { "0" });
}

#[async_trait]
impl ReservationStore for RedisReservationStore {
    #[instrument(skip(self, lines), fields(count = lines.len()), err)]
    async fn sync_stock(&self, lines: &[StockLine], force: bool) -> Result<(), StoreError> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut invocation = self.scripts.sync.prepare_invoke();
        invocation.arg(&self.prefix).arg(if force { "1" } else { "0" });
        for line in lines {
            push_snapshot(&mut invocation, line);
        }
        let mut conn = self.conn.clone();
        let _: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn levels(
        &self,
        ids: &[ProductItemId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Option<StockLevel>>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut invocation = self.scripts.levels.prepare_invoke();
        invocation.arg(&self.prefix).arg(millis(now));
        for id in ids {
            invocation.arg(id.to_string());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<String> = invocation.invoke_async(&mut conn).await.map_err(backend)?;
        if raw.len() != ids.len() * 4 {
            return Err(corrupt("levels reply has the wrong length"));
        }

        ids.iter()
            .zip(raw.chunks_exact(4))
            .map(|(id, chunk)| {
                if chunk[0] != "1" {
                    return Ok(None);
                }
                Ok(Some(StockLevel {
                    product_item_id: *id,
                    on_hand: parse_u64(&chunk[1])?,
                    reserved: parse_u64(&chunk[2])?,
                    sellable: chunk[3] == "1",
                }))
            })
            .collect()
    }

    #[instrument(skip(self, reservation), fields(order_id = %reservation.order_id()), err)]
    async fn reserve(
        &self,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let lines_json = encode_lines(reservation.lines())?;
        let mut invocation = self.scripts.reserve.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(reservation.order_id().to_string())
            .arg(millis(now))
            .arg(millis(reservation.created_at()))
            .arg(millis(reservation.expires_at()))
            .arg(lines_json);
        let mut conn = self.conn.clone();
        let reply = Reply::parse(invocation.invoke_async(&mut conn).await.map_err(backend)?)?;

        match reply.code.as_str() {
            "reserved" => Ok(ReserveOutcome::Reserved(reply.record()?)),
            "already" => Ok(ReserveOutcome::AlreadyReserved(reply.record()?)),
            "conflict" => Ok(ReserveOutcome::Conflict {
                existing: reply.record()?.state(),
            }),
            "unseeded" => reply
                .rest
                .iter()
                .map(|raw| raw.parse::<ProductItemId>().map_err(corrupt))
                .collect::<Result<Vec<_>, _>>()
                .map(ReserveOutcome::Unseeded),
            "insufficient" => reply
                .rest
                .chunks_exact(3)
                .map(|c| {
                    Ok(ShortLine {
                        product_item_id: c[0].parse().map_err(corrupt)?,
                        requested: parse_u64(&c[1])?,
                        available: parse_u64(&c[2])?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()
                .map(ReserveOutcome::Insufficient),
            _ => Err(reply.unexpected("reserve")),
        }
    }

    #[instrument(skip(self, proposed), fields(product_item_id = %proposed.product_item_id()), err)]
    async fn admit_override(
        &self,
        proposed: &StockLine,
        now: DateTime<Utc>,
    ) -> Result<OverrideVerdict, StoreError> {
        if proposed.qty_in_stock() > MAX_SCRIPT_QUANTITY {
            return Err(StoreError::Backend(format!(
                "quantity {} exceeds the store's range",
                proposed.qty_in_stock()
            )));
        }
        let mut invocation = self.scripts.admit_override.prepare_invoke();
        invocation.arg(&self.prefix).arg(millis(now));
        push_snapshot(&mut invocation, proposed);
        let mut conn = self.conn.clone();
        let reply = Reply::parse(invocation.invoke_async(&mut conn).await.map_err(backend)?)?;

        let reserved = reply
            .rest
            .first()
            .ok_or_else(|| corrupt("override reply without reserved"))
            .and_then(|raw| parse_u64(raw))?;
        match reply.code.as_str() {
            "admitted" => Ok(OverrideVerdict::Admitted { reserved }),
            "conflict" => Ok(OverrideVerdict::Conflict { reserved }),
            _ => Err(reply.unexpected("override")),
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn find(&self, order_id: OrderId) -> Result<Option<Reservation>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.order_key(order_id))
            .await
            .map_err(backend)?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_reservation(&fields).map(Some)
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn begin_consume(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<ConsumeClaim, StoreError> {
        let mut invocation = self.scripts.begin_consume.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(order_id.to_string())
            .arg(millis(now));
        let mut conn = self.conn.clone();
        let reply = Reply::parse(invocation.invoke_async(&mut conn).await.map_err(backend)?)?;

        match reply.code.as_str() {
            "claimed" => Ok(ConsumeClaim::Claimed(reply.record()?)),
            "already_consumed" => Ok(ConsumeClaim::AlreadyConsumed(reply.record()?)),
            "released" => Ok(ConsumeClaim::Released(reply.record()?)),
            "in_progress" => Ok(ConsumeClaim::InProgress),
            "expired" => Ok(ConsumeClaim::Expired),
            "not_found" => Ok(ConsumeClaim::NotFound),
            _ => Err(reply.unexpected("begin_consume")),
        }
    }

    #[instrument(skip(self, synced), fields(order_id = %order_id), err)]
    async fn finish_consume(
        &self,
        order_id: OrderId,
        synced: &[StockLine],
        now: DateTime<Utc>,
    ) -> Result<FinishOutcome, StoreError> {
        let mut invocation = self.scripts.finish_consume.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(order_id.to_string())
            .arg(millis(now))
            .arg(self.retention_ms);
        for line in synced {
            push_snapshot(&mut invocation, line);
        }
        let mut conn = self.conn.clone();
        let reply = Reply::parse(invocation.invoke_async(&mut conn).await.map_err(backend)?)?;

        match reply.code.as_str() {
            "consumed" => Ok(FinishOutcome::Consumed(reply.record()?)),
            "already_consumed" => Ok(FinishOutcome::AlreadyConsumed(reply.record()?)),
            "orphaned" => Ok(FinishOutcome::Orphaned),
            _ => Err(reply.unexpected("finish_consume")),
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn abort_consume(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<AbortDecision, StoreError> {
        let mut invocation = self.scripts.abort_consume.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(order_id.to_string())
            .arg(millis(now))
            .arg(self.retention_ms);
        let mut conn = self.conn.clone();
        let reply = Reply::parse(invocation.invoke_async(&mut conn).await.map_err(backend)?)?;

        match reply.code.as_str() {
            "restored" => Ok(AbortDecision::Restored),
            "not_claimed" => Ok(AbortDecision::NotClaimed),
            "released" => {
                let reason = reply
                    .rest
                    .first()
                    .ok_or_else(|| corrupt("abort reply without reason"))
                    .and_then(|raw| ReleaseReason::parse(raw).map_err(corrupt))?;
                Ok(AbortDecision::Released(reason))
            }
            _ => Err(reply.unexpected("abort_consume")),
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id, reason = reason.as_str()), err)]
    async fn release(
        &self,
        order_id: OrderId,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, StoreError> {
        let mut invocation = self.scripts.release.prepare_invoke();
        invocation
            .arg(&self.prefix)
            .arg(order_id.to_string())
            .arg(reason.as_str())
            .arg(millis(now))
            .arg(self.retention_ms);
        let mut conn = self.conn.clone();
        let reply = Reply::parse(invocation.invoke_async(&mut conn).await.map_err(backend)?)?;

        match reply.code.as_str() {
            "released" => Ok(ReleaseOutcome::Released(reply.record()?)),
            "deferred" => Ok(ReleaseOutcome::Deferred(reply.record()?)),
            "terminal" => Ok(ReleaseOutcome::AlreadyTerminal(reply.record()?)),
            "busy" => Ok(ReleaseOutcome::Busy),
            "not_due" => Ok(ReleaseOutcome::NotDue),
            "not_found" => Ok(ReleaseOutcome::NotFound),
            _ => Err(reply.unexpected("release")),
        }
    }

    async fn due_for_expiry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.due_key())
            .arg("-inf")
            .arg(millis(now))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        raw.iter().map(|id| id.parse().map_err(corrupt)).collect()
    }

    async fn stalled_claims(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OrderId>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.consuming_key())
            .arg("-inf")
            .arg(millis(claimed_before))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        raw.iter().map(|id| id.parse().map_err(corrupt)).collect()
    }
}
