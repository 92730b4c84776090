//! Availability arithmetic shared by every reservation store.

use serde::{Deserialize, Serialize};

use stockhold_core::ProductItemId;

use crate::reservation::ReservationLine;

/// Point-in-time view of one SKU: ledger quantity plus active holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub product_item_id: ProductItemId,
    pub on_hand: u64,
    /// Sum of active (held and in-window, or claimed) reservations.
    pub reserved: u64,
    pub sellable: bool,
}

impl StockLevel {
    /// `on_hand - reserved`, or zero for lines that are not sellable.
    pub fn available(&self) -> u64 {
        if !self.sellable {
            return 0;
        }
        self.on_hand.saturating_sub(self.reserved)
    }
}

/// A requested line that cannot be satisfied.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortLine {
    pub product_item_id: ProductItemId,
    pub requested: u64,
    pub available: u64,
}

/// Per-line answer to a stock check.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAvailability {
    pub product_item_id: ProductItemId,
    pub requested: u64,
    pub available: u64,
    pub sufficient: bool,
}

impl LineAvailability {
    pub fn evaluate(level: &StockLevel, requested: u64) -> Self {
        let available = level.available();
        Self {
            product_item_id: level.product_item_id,
            requested,
            available,
            sufficient: requested <= available,
        }
    }
}

/// All-or-nothing basket check.
///
/// Every line is evaluated before a verdict is returned, so a rejection lists
/// all short lines, not just the first. A line without a level counts as
/// unavailable.
pub fn evaluate_basket(levels: &[StockLevel], lines: &[ReservationLine]) -> Result<(), Vec<ShortLine>> {
    let short: Vec<ShortLine> = lines
        .iter()
        .filter_map(|line| {
            let available = levels
                .iter()
                .find(|l| l.product_item_id == line.product_item_id)
                .map(StockLevel::available)
                .unwrap_or(0);
            (line.quantity > available).then_some(ShortLine {
                product_item_id: line.product_item_id,
                requested: line.quantity,
                available,
            })
        })
        .collect();

    if short.is_empty() { Ok(()) } else { Err(short) }
}
