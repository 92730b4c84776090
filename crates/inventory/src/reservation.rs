use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stockhold_core::{DomainError, DomainResult, OrderId, ProductItemId};

/// Upper bound on distinct SKUs in one basket.
pub const MAX_LINES: usize = 100;

/// One SKU/quantity pair of a reservation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationLine {
    pub product_item_id: ProductItemId,
    pub quantity: u64,
}

impl ReservationLine {
    pub fn new(product_item_id: ProductItemId, quantity: u64) -> Self {
        Self {
            product_item_id,
            quantity,
        }
    }
}

/// Validate and canonicalize requested lines.
///
/// - at least one line, at most [`MAX_LINES`] distinct SKUs
/// - every quantity is positive
/// - duplicate SKUs are merged by summing
/// - output is sorted by `product_item_id` (the lock acquisition order)
pub fn normalize_lines(
    lines: impl IntoIterator<Item = ReservationLine>,
) -> DomainResult<Vec<ReservationLine>> {
    let mut merged: BTreeMap<ProductItemId, u64> = BTreeMap::new();

    for line in lines {
        if line.quantity == 0 {
            return Err(DomainError::validation(format!(
                "quantity for {} must be positive",
                line.product_item_id
            )));
        }
        let slot = merged.entry(line.product_item_id).or_insert(0);
        *slot = slot.checked_add(line.quantity).ok_or_else(|| {
            DomainError::validation(format!("quantity for {} overflows", line.product_item_id))
        })?;
    }

    if merged.is_empty() {
        return Err(DomainError::validation("at least one line is required"));
    }
    if merged.len() > MAX_LINES {
        return Err(DomainError::validation(format!(
            "at most {MAX_LINES} distinct product items per request"
        )));
    }

    Ok(merged
        .into_iter()
        .map(|(product_item_id, quantity)| ReservationLine::new(product_item_id, quantity))
        .collect())
}

/// Why a hold was released.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Explicit `ReleaseStock` (order cancelled, checkout session timed out).
    Cancelled,
    /// The checkout window elapsed without resolution.
    Expired,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::Cancelled => "cancelled",
            ReleaseReason::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "cancelled" => Ok(ReleaseReason::Cancelled),
            "expired" => Ok(ReleaseReason::Expired),
            other => Err(DomainError::validation(format!("unknown release reason: {other}"))),
        }
    }
}

/// Reservation lifecycle.
///
/// ```text
/// Held ──claim──▶ Consuming ──consume──▶ Consumed
///  │  ◀──abort────────┘
///  └──release──▶ Released{Cancelled | Expired}
/// ```
///
/// `Consumed` and `Released` are terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReservationState {
    Held,
    /// Claimed by an in-flight deduction; never expires while claimed.
    Consuming { claimed_at: DateTime<Utc> },
    Consumed { at: DateTime<Utc> },
    Released { at: DateTime<Utc>, reason: ReleaseReason },
}

impl ReservationState {
    pub fn label(&self) -> &'static str {
        match self {
            ReservationState::Held => "held",
            ReservationState::Consuming { .. } => "consuming",
            ReservationState::Consumed { .. } => "consumed",
            ReservationState::Released { .. } => "released",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationState::Consumed { .. } | ReservationState::Released { .. }
        )
    }

    /// When the record reached its terminal state.
    pub fn settled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ReservationState::Consumed { at } | ReservationState::Released { at, .. } => Some(*at),
            _ => None,
        }
    }
}

/// Result of asking a reservation to release.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// Hold released now; its quantities must be returned to availability.
    Released,
    /// A deduction holds the claim; the cancellation is recorded and applied if
    /// that deduction aborts.
    Deferred,
    /// A deduction holds the claim and expiry never preempts it.
    Busy,
    /// Expiry requested but the window is still open.
    NotDue,
    /// Already consumed or released.
    AlreadyTerminal,
}

/// Result of aborting a claim.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortDecision {
    /// Back to `Held`, quantities stay reserved.
    Restored,
    /// Released (cancellation was requested or the window elapsed).
    Released(ReleaseReason),
    /// Nothing was claimed.
    NotClaimed,
}

/// A temporary, exclusive claim against available stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    order_id: OrderId,
    lines: Vec<ReservationLine>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(flatten)]
    state: ReservationState,
    #[serde(default)]
    cancel_requested: bool,
}

impl Reservation {
    /// Create a new hold. `lines` are normalized here.
    pub fn new(
        order_id: OrderId,
        lines: impl IntoIterator<Item = ReservationLine>,
        now: DateTime<Utc>,
        window: Duration,
    ) -> DomainResult<Self> {
        if window <= Duration::zero() {
            return Err(DomainError::validation("checkout window must be positive"));
        }
        Ok(Self {
            order_id,
            lines: normalize_lines(lines)?,
            created_at: now,
            expires_at: now + window,
            state: ReservationState::Held,
            cancel_requested: false,
        })
    }

    /// Rehydrate a persisted record.
    pub fn restore(
        order_id: OrderId,
        lines: Vec<ReservationLine>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        state: ReservationState,
        cancel_requested: bool,
    ) -> Self {
        Self {
            order_id,
            lines,
            created_at,
            expires_at,
            state,
            cancel_requested,
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn lines(&self) -> &[ReservationLine] {
        &self.lines
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn product_item_ids(&self) -> impl Iterator<Item = ProductItemId> + '_ {
        self.lines.iter().map(|l| l.product_item_id)
    }

    pub fn quantity_for(&self, product_item_id: ProductItemId) -> u64 {
        self.lines
            .iter()
            .find(|l| l.product_item_id == product_item_id)
            .map(|l| l.quantity)
            .unwrap_or(0)
    }

    /// Same basket (lines are normalized on both sides).
    pub fn same_lines(&self, other: &[ReservationLine]) -> bool {
        self.lines == other
    }

    /// A `Held` record whose window has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Held && self.expires_at <= now
    }

    /// Counts against availability: held and in-window, or claimed.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ReservationState::Held => self.expires_at > now,
            ReservationState::Consuming { .. } => true,
            _ => false,
        }
    }

    /// `Held → Consuming`.
    pub fn claim(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.state != ReservationState::Held {
            return Err(DomainError::illegal_transition(format!(
                "cannot claim a {} reservation",
                self.state.label()
            )));
        }
        if self.is_expired(now) {
            return Err(DomainError::illegal_transition("cannot claim an expired reservation"));
        }
        self.state = ReservationState::Consuming { claimed_at: now };
        Ok(())
    }

    /// `Consuming → Held`, or straight to `Released` when cancellation was
    /// requested meanwhile or the window has elapsed.
    pub fn abort_claim(&mut self, now: DateTime<Utc>) -> AbortDecision {
        if !matches!(self.state, ReservationState::Consuming { .. }) {
            return AbortDecision::NotClaimed;
        }
        let reason = if self.cancel_requested {
            Some(ReleaseReason::Cancelled)
        } else if self.expires_at <= now {
            Some(ReleaseReason::Expired)
        } else {
            None
        };
        match reason {
            Some(reason) => {
                self.settle_released(reason, now);
                AbortDecision::Released(reason)
            }
            None => {
                self.state = ReservationState::Held;
                AbortDecision::Restored
            }
        }
    }

    /// `Held | Consuming → Consumed`.
    pub fn consume(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        match self.state {
            ReservationState::Held | ReservationState::Consuming { .. } => {
                self.state = ReservationState::Consumed { at: now };
                self.cancel_requested = false;
                Ok(())
            }
            other => Err(DomainError::illegal_transition(format!(
                "cannot consume a {} reservation",
                other.label()
            ))),
        }
    }

    /// Release for `reason`. Expiry only fires on an elapsed `Held` record.
    pub fn release(&mut self, reason: ReleaseReason, now: DateTime<Utc>) -> ReleaseDecision {
        match (self.state, reason) {
            (ReservationState::Consumed { .. } | ReservationState::Released { .. }, _) => {
                ReleaseDecision::AlreadyTerminal
            }
            (ReservationState::Consuming { .. }, ReleaseReason::Cancelled) => {
                self.cancel_requested = true;
                ReleaseDecision::Deferred
            }
            (ReservationState::Consuming { .. }, ReleaseReason::Expired) => ReleaseDecision::Busy,
            (ReservationState::Held, ReleaseReason::Expired) if self.expires_at > now => {
                ReleaseDecision::NotDue
            }
            (ReservationState::Held, _) => {
                self.settle_released(reason, now);
                ReleaseDecision::Released
            }
        }
    }

    fn settle_released(&mut self, reason: ReleaseReason, now: DateTime<Utc>) {
        self.state = ReservationState::Released { at: now, reason };
        self.cancel_requested = false;
    }
}
