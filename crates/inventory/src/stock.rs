use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockhold_core::{DomainError, DomainResult, ProductItemId};

/// Lifecycle status of a stock line.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockStatus {
    Active,
    OutOfStock,
    /// Set by the catalog; sticky across quantity changes.
    Disabled,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::Active => "ACTIVE",
            StockStatus::OutOfStock => "OUT_OF_STOCK",
            StockStatus::Disabled => "DISABLED",
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        match s {
            "ACTIVE" => Ok(StockStatus::Active),
            "OUT_OF_STOCK" => Ok(StockStatus::OutOfStock),
            "DISABLED" => Ok(StockStatus::Disabled),
            other => Err(DomainError::validation(format!("unknown stock status: {other}"))),
        }
    }

    /// Status implied by a quantity, keeping `Disabled` sticky.
    fn derive(current: Option<StockStatus>, qty_in_stock: u64) -> Self {
        match current {
            Some(StockStatus::Disabled) => StockStatus::Disabled,
            _ if qty_in_stock == 0 => StockStatus::OutOfStock,
            _ => StockStatus::Active,
        }
    }
}

impl core::fmt::Display for StockStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable stock line: the store of record for `qty_in_stock`.
///
/// Every mutation produces a new value with `version + 1`. Caches mirroring a
/// line use the version to discard stale updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    product_item_id: ProductItemId,
    qty_in_stock: u64,
    status: StockStatus,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl StockLine {
    /// A freshly registered line (version 1).
    pub fn new(product_item_id: ProductItemId, qty_in_stock: u64, now: DateTime<Utc>) -> Self {
        Self {
            product_item_id,
            qty_in_stock,
            status: StockStatus::derive(None, qty_in_stock),
            version: 1,
            updated_at: now,
        }
    }

    /// Rehydrate a persisted line.
    pub fn restore(
        product_item_id: ProductItemId,
        qty_in_stock: u64,
        status: StockStatus,
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            product_item_id,
            qty_in_stock,
            status,
            version,
            updated_at,
        }
    }

    pub fn product_item_id(&self) -> ProductItemId {
        self.product_item_id
    }

    pub fn qty_in_stock(&self) -> u64 {
        self.qty_in_stock
    }

    pub fn status(&self) -> StockStatus {
        self.status
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether new reservations may be taken against this line.
    pub fn is_sellable(&self) -> bool {
        self.status != StockStatus::Disabled
    }

    /// Permanently remove `quantity` units (payment confirmed).
    pub fn deduct(&self, quantity: u64, now: DateTime<Utc>) -> DomainResult<StockLine> {
        if quantity == 0 {
            return Err(DomainError::validation("deduction quantity must be positive"));
        }
        let remaining = self.qty_in_stock.checked_sub(quantity).ok_or_else(|| {
            DomainError::invariant(format!(
                "stock line {} holds {} units, cannot deduct {}",
                self.product_item_id, self.qty_in_stock, quantity
            ))
        })?;
        Ok(self.next(remaining, StockStatus::derive(Some(self.status), remaining), now))
    }

    /// Administrative override of the quantity (e.g. restock, stock count).
    pub fn with_quantity(&self, qty_in_stock: u64, now: DateTime<Utc>) -> StockLine {
        self.next(qty_in_stock, StockStatus::derive(Some(self.status), qty_in_stock), now)
    }

    /// Catalog disable: the line stops being sellable, quantity unchanged.
    pub fn disable(&self, now: DateTime<Utc>) -> StockLine {
        self.next(self.qty_in_stock, StockStatus::Disabled, now)
    }

    /// Catalog re-enable: status derived from quantity again.
    pub fn enable(&self, now: DateTime<Utc>) -> StockLine {
        self.next(self.qty_in_stock, StockStatus::derive(None, self.qty_in_stock), now)
    }

    fn next(&self, qty_in_stock: u64, status: StockStatus, now: DateTime<Utc>) -> StockLine {
        StockLine {
            product_item_id: self.product_item_id,
            qty_in_stock,
            status,
            version: self.version + 1,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(qty: u64) -> StockLine {
        StockLine::new(ProductItemId::new(), qty, Utc::now())
    }

    #[test]
    fn new_line_derives_status_from_quantity() {
        assert_eq!(line(5).status(), StockStatus::Active);
        assert_eq!(line(0).status(), StockStatus::OutOfStock);
        assert_eq!(line(5).version(), 1);
    }

    #[test]
    fn deduct_bumps_version_and_flips_to_out_of_stock() {
        let l = line(2);
        let after = l.deduct(2, Utc::now()).unwrap();
        assert_eq!(after.qty_in_stock(), 0);
        assert_eq!(after.status(), StockStatus::OutOfStock);
        assert_eq!(after.version(), 2);
    }

    #[test]
    fn deduct_rejects_more_than_on_hand() {
        let err = line(1).deduct(2, Utc::now()).unwrap_err();
        match err {
            DomainError::InvariantViolation(_) => {}
            other => panic!("expected InvariantViolation, got {other:?}"),
        }
    }

    #[test]
    fn deduct_rejects_zero() {
        assert!(matches!(
            line(1).deduct(0, Utc::now()),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn disabled_is_sticky_across_overrides() {
        let l = line(3).disable(Utc::now());
        assert!(!l.is_sellable());

        let restocked = l.with_quantity(10, Utc::now());
        assert_eq!(restocked.status(), StockStatus::Disabled);
        assert_eq!(restocked.version(), 3);

        let enabled = restocked.enable(Utc::now());
        assert_eq!(enabled.status(), StockStatus::Active);
    }

    #[test]
    fn status_parses_its_own_labels() {
        for s in [StockStatus::Active, StockStatus::OutOfStock, StockStatus::Disabled] {
            assert_eq!(StockStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(StockStatus::parse("archived").is_err());
    }
}
