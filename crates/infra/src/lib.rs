//! Infrastructure layer: stock ledger, reservation store, sweeper and the
//! service that composes them.
//!
//! Backends:
//! - in-memory ledger and store (tests, single-process deployments)
//! - Postgres ledger (`ledger::PostgresStockLedger`)
//! - Redis store and expiry listener (`redis` feature)

pub mod config;
pub mod error;
pub mod ledger;
pub mod reservations;
pub mod service;
pub mod sweeper;


pub use config::{ConfigError, EngineConfig, RetryPolicy, SweeperConfig};
pub use error::StockError;
pub use service::{DeductReceipt, ReleaseStatus, ReserveReceipt, StockService};
pub use sweeper::{
    ClaimRecovery, Compensation, ExpiryNotifier, ReservationSweeper, SweepReport, SweeperHandle,
};
