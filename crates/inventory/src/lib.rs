//! Inventory reservation domain.
//!
//! This crate contains the business rules for stock lines and reservations,
//! implemented purely as deterministic domain logic (no IO, no HTTP, no storage).

pub mod availability;
pub mod reservation;
pub mod stock;

pub use availability::{evaluate_basket, LineAvailability, ShortLine, StockLevel};
pub use reservation::{
    normalize_lines, AbortDecision, ReleaseDecision, ReleaseReason, Reservation, ReservationLine,
    ReservationState, MAX_LINES,
};
pub use stock::{StockLine, StockStatus};
