//! Postgres-backed stock ledger.
//!
//! Every write runs in a transaction that locks the affected `stock_lines`
//! rows with `SELECT ... FOR UPDATE` in ascending `product_item_id` order and
//! then updates them with a `version` predicate.
//!
//! ## Error Mapping
//!
//! | PostgreSQL Error Code | LedgerError | Scenario |
//! |----------------------|-------------|----------|
//! | `23505` unique violation | `Concurrency` | Two writers created the same line |
//! | `40001` serialization failure | `Concurrency` | Transaction aborted by the server |
//! | `40P01` deadlock detected | `Concurrency` | Lock cycle (should not occur given lock order) |
//! | `55P03` lock not available | `Concurrency` | `lock_timeout` elapsed while waiting for a row |
//! | `23514` check violation | `Database` | Negative quantity reached the table |
//! | Any other | `Database` | Network errors, pool closed, etc. |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};
use uuid::Uuid;

use stockhold_core::{OrderId, ProductItemId};
use stockhold_inventory::{ReservationLine, StockLine, StockStatus};

use super::{apply_deduction, DeductOutcome, LedgerError, OverrideGuard, StockLedger};
use crate::error::StockError;

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledger.sql");

/// Postgres-backed stock ledger.
#[derive(Debug, Clone)]
pub struct PostgresStockLedger {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresStockLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout: Duration::from_secs(2),
        }
    }

    /// Upper bound on waiting for a row lock inside a write transaction.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Create the ledger tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        // SET does not accept bind parameters.
        let stmt = format!("SET LOCAL lock_timeout = {}", self.lock_timeout.as_millis());
        sqlx::query(&stmt)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;
        Ok(tx)
    }
}

#[async_trait]
impl StockLedger for PostgresStockLedger {
    #[instrument(skip(self), fields(product_item_id = %product_item_id), err)]
    async fn get(&self, product_item_id: ProductItemId) -> Result<Option<StockLine>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT product_item_id, qty_in_stock, status, version, updated_at
            FROM stock_lines
            WHERE product_item_id = $1
            "#,
        )
        .bind(product_item_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_line).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_many(&self, ids: &[ProductItemId]) -> Result<Vec<StockLine>, LedgerError> {
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT product_item_id, qty_in_stock, status, version, updated_at
            FROM stock_lines
            WHERE product_item_id = ANY($1)
            ORDER BY product_item_id ASC
            "#,
        )
        .bind(&uuids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_many", e))?;

        rows.iter().map(decode_line).collect()
    }

    #[instrument(
        skip(self, lines),
        fields(order_id = %order_id, line_count = lines.len(), replayed = tracing::field::Empty),
        err
    )]
    async fn deduct(
        &self,
        order_id: OrderId,
        lines: &[ReservationLine],
        now: DateTime<Utc>,
    ) -> Result<DeductOutcome, LedgerError> {
        let span = Span::current();
        let mut tx = self.begin().await?;

        // Claim the order first; a concurrent duplicate blocks on the key and
        // then sees zero rows inserted.
        let inserted = sqlx::query(
            r#"
            INSERT INTO stock_deductions (order_id, lines, deducted_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(Json(lines))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_deduction", e))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            span.record("replayed", true);
            return Ok(DeductOutcome::AlreadyApplied);
        }

        let ids: Vec<ProductItemId> = lines.iter().map(|l| l.product_item_id).collect();
        let locked = lock_rows(&mut tx, &ids).await?;
        let updated = match apply_deduction(&locked, lines, now) {
            Ok(updated) => updated,
            Err(e) => {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(e);
            }
        };

        for after in &updated {
            let expected = locked
                .iter()
                .find(|before| before.product_item_id() == after.product_item_id())
                .map(StockLine::version)
                .ok_or(LedgerError::NotFound(after.product_item_id()))?;
            write_line(&mut tx, expected, after).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(DeductOutcome::Applied(updated))
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn find_deduction(
        &self,
        order_id: OrderId,
    ) -> Result<Option<Vec<ReservationLine>>, LedgerError> {
        let row = sqlx::query("SELECT lines FROM stock_deductions WHERE order_id = $1")
            .bind(order_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_deduction", e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let Json(lines): Json<Vec<ReservationLine>> = row
                    .try_get("lines")
                    .map_err(|e| LedgerError::Corrupt(format!("deduction lines: {e}")))?;
                Ok(Some(lines))
            }
        }
    }

    #[instrument(
        skip(self, guard),
        fields(product_item_id = %product_item_id),
        err
    )]
    async fn override_stock(
        &self,
        product_item_id: ProductItemId,
        new_qty: u64,
        now: DateTime<Utc>,
        guard: &dyn OverrideGuard,
    ) -> Result<StockLine, LedgerError> {
        to_db_qty(new_qty)?;
        let mut tx = self.begin().await?;
        let current = lock_rows(&mut tx, &[product_item_id]).await?.pop();

        let proposed = match &current {
            Some(line) => line.with_quantity(new_qty, now),
            None => StockLine::new(product_item_id, new_qty, now),
        };

        if let Err(rejection) = guard.admit(&proposed).await {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerError::Rejected(Box::new(rejection)));
        }

        match &current {
            Some(before) => write_line(&mut tx, before.version(), &proposed).await?,
            None => insert_line(&mut tx, &proposed).await?,
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(proposed)
    }

    #[instrument(skip(self, line), fields(product_item_id = %line.product_item_id()), err)]
    async fn register(&self, line: StockLine) -> Result<StockLine, LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO stock_lines (product_item_id, qty_in_stock, status, version, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (product_item_id) DO NOTHING
            "#,
        )
        .bind(line.product_item_id().as_uuid())
        .bind(to_db_qty(line.qty_in_stock())?)
        .bind(line.status().as_str())
        .bind(to_db_version(line.version())?)
        .bind(line.updated_at())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("register", e))?;

        self.get(line.product_item_id())
            .await?
            .ok_or(LedgerError::NotFound(line.product_item_id()))
    }

    #[instrument(skip(self), fields(product_item_id = %product_item_id), err)]
    async fn set_sellable(
        &self,
        product_item_id: ProductItemId,
        sellable: bool,
        now: DateTime<Utc>,
    ) -> Result<StockLine, LedgerError> {
        let mut tx = self.begin().await?;
        let Some(current) = lock_rows(&mut tx, &[product_item_id]).await?.pop() else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerError::NotFound(product_item_id));
        };

        if current.is_sellable() == sellable {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(current);
        }

        let next = if sellable {
            current.enable(now)
        } else {
            current.disable(now)
        };
        write_line(&mut tx, current.version(), &next).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(next)
    }
}

/// `SELECT ... FOR UPDATE` in ascending id order.
async fn lock_rows(
    tx: &mut Transaction<'static, Postgres>,
    ids: &[ProductItemId],
) -> Result<Vec<StockLine>, LedgerError> {
    let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
    let rows = sqlx::query(
        r#"
        SELECT product_item_id, qty_in_stock, status, version, updated_at
        FROM stock_lines
        WHERE product_item_id = ANY($1)
        ORDER BY product_item_id ASC
        FOR UPDATE
        "#,
    )
    .bind(&uuids)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_rows", e))?;

    rows.iter().map(decode_line).collect()
}

async fn write_line(
    tx: &mut Transaction<'static, Postgres>,
    expected_version: u64,
    line: &StockLine,
) -> Result<(), LedgerError> {
    let affected = sqlx::query(
        r#"
        UPDATE stock_lines
        SET qty_in_stock = $2, status = $3, version = $4, updated_at = $5
        WHERE product_item_id = $1 AND version = $6
        "#,
    )
    .bind(line.product_item_id().as_uuid())
    .bind(to_db_qty(line.qty_in_stock())?)
    .bind(line.status().as_str())
    .bind(to_db_version(line.version())?)
    .bind(line.updated_at())
    .bind(to_db_version(expected_version)?)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_line", e))?
    .rows_affected();

    if affected == 0 {
        return Err(LedgerError::Concurrency(format!(
            "stock line {} moved past version {}",
            line.product_item_id(),
            expected_version
        )));
    }
    Ok(())
}

async fn insert_line(
    tx: &mut Transaction<'static, Postgres>,
    line: &StockLine,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO stock_lines (product_item_id, qty_in_stock, status, version, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(line.product_item_id().as_uuid())
    .bind(to_db_qty(line.qty_in_stock())?)
    .bind(line.status().as_str())
    .bind(to_db_version(line.version())?)
    .bind(line.updated_at())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_line", e))?;
    Ok(())
}

fn decode_line(row: &sqlx::postgres::PgRow) -> Result<StockLine, LedgerError> {
    let corrupt = |e: sqlx::Error| LedgerError::Corrupt(e.to_string());
    let id: Uuid = row.try_get("product_item_id").map_err(corrupt)?;
    let qty: i64 = row.try_get("qty_in_stock").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let version: i64 = row.try_get("version").map_err(corrupt)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(corrupt)?;

    let qty = u64::try_from(qty)
        .map_err(|_| LedgerError::Corrupt(format!("negative qty_in_stock for {id}")))?;
    let version = u64::try_from(version)
        .map_err(|_| LedgerError::Corrupt(format!("negative version for {id}")))?;
    let status = StockStatus::parse(&status).map_err(|e| LedgerError::Corrupt(e.to_string()))?;

    Ok(StockLine::restore(
        ProductItemId::from_uuid(id),
        qty,
        status,
        version,
        updated_at,
    ))
}

fn to_db_qty(qty: u64) -> Result<i64, LedgerError> {
    i64::try_from(qty).map_err(|_| {
        LedgerError::Rejected(Box::new(StockError::Validation(format!(
            "quantity {qty} exceeds the ledger range"
        ))))
    })
}

fn to_db_version(version: u64) -> Result<i64, LedgerError> {
    i64::try_from(version)
        .map_err(|_| LedgerError::Corrupt(format!("version {version} exceeds the ledger range")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") | Some("55P03") => {
                    LedgerError::Concurrency(msg)
                }
                _ => LedgerError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Database(format!("connection pool closed in {}", operation))
        }
        _ => LedgerError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
