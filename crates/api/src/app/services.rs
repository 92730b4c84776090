//! Backend wiring: builds the `StockService` and its background workers.
//!
//! Connections are created once here and injected; nothing is global.

use std::sync::Arc;

use thiserror::Error;

use stockhold_core::{Clock, SystemClock};
use stockhold_infra::ledger::InMemoryStockLedger;
use stockhold_infra::reservations::InMemoryReservationStore;
use stockhold_infra::{EngineConfig, StockService, SweeperHandle};

#[cfg(feature = "redis")]
use stockhold_infra::ledger::PostgresStockLedger;
#[cfg(feature = "redis")]
use stockhold_infra::reservations::{RedisExpiryListener, RedisExpiryListenerHandle, RedisReservationStore};
#[cfg(feature = "redis")]
use sqlx::PgPool;

use crate::config::ServerConfig;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("postgres: {0}")]
    Database(String),

    #[error("redis: {0}")]
    Redis(String),

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("failed to start background worker: {0}")]
    Worker(#[from] std::io::Error),
}

/// Shared state for request handlers.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub stock: StockService,
    /// `in_memory` or `postgres+redis`.
    pub backend: &'static str,
}

/// Background workers started alongside the services.
#[derive(Debug)]
pub struct Background {
    sweeper: SweeperHandle,
    #[cfg(feature = "redis")]
    expiry_listener: Option<RedisExpiryListenerHandle>,
}

impl Background {
    /// Stop the listener, then drain the sweeper.
    pub async fn shutdown(self) {
        #[cfg(feature = "redis")]
        if let Some(listener) = self.expiry_listener {
            if let Err(e) = tokio::task::spawn_blocking(move || listener.shutdown()).await {
                tracing::warn!(error = %e, "expiry listener did not stop cleanly");
            }
        }
        self.sweeper.shutdown().await;
    }
}

pub async fn build_services(config: &ServerConfig) -> Result<(AppServices, Background), BootstrapError> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    let services = build_in_memory_services(config.engine.clone(), Arc::new(SystemClock));
    let sweeper = Arc::new(services.stock.sweeper()).spawn();
    Ok((
        services,
        Background {
            sweeper,
            #[cfg(feature = "redis")]
            expiry_listener: None,
        },
    ))
}

/// In-memory ledger and store (dev/test). Starts no workers.
pub fn build_in_memory_services(engine: EngineConfig, clock: Arc<dyn Clock>) -> AppServices {
    let ledger = Arc::new(InMemoryStockLedger::new());
    let store = Arc::new(InMemoryReservationStore::new(engine.tombstone_retention_chrono()));
    AppServices {
        stock: StockService::new(ledger, store, clock, engine),
        backend: "in_memory",
    }
}

#[cfg(feature = "redis")]
async fn build_persistent_services(
    config: &ServerConfig,
) -> Result<(AppServices, Background), BootstrapError> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or(BootstrapError::Missing("DATABASE_URL"))?;

    let pool = PgPool::connect(database_url)
        .await
        .map_err(|e| BootstrapError::Database(e.to_string()))?;
    let ledger = PostgresStockLedger::new(pool);
    ledger
        .migrate()
        .await
        .map_err(|e| BootstrapError::Database(e.to_string()))?;

    let store = RedisReservationStore::connect(
        &config.redis_url,
        config.redis_key_prefix.clone(),
        config.engine.tombstone_retention_chrono(),
    )
    .await
    .map_err(|e| BootstrapError::Redis(e.to_string()))?;
    let ttl_key_prefix = store.ttl_key_prefix();

    let stock = StockService::new(
        Arc::new(ledger),
        Arc::new(store),
        Arc::new(SystemClock),
        config.engine.clone(),
    );
    let sweeper = Arc::new(stock.sweeper()).spawn();

    let expiry_listener = if config.redis_expiry_events {
        let listener = RedisExpiryListener::new(&config.redis_url, ttl_key_prefix)
            .map_err(|e| BootstrapError::Redis(e.to_string()))?
            .configure_server(true);
        Some(listener.spawn(sweeper.notifier())?)
    } else {
        None
    };

    tracing::info!(
        redis_key_prefix = %config.redis_key_prefix,
        expiry_events = config.redis_expiry_events,
        "persistent stores ready"
    );

    Ok((
        AppServices {
            stock,
            backend: "postgres+redis",
        },
        Background {
            sweeper,
            expiry_listener,
        },
    ))
}
