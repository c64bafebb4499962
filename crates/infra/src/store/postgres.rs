//! Postgres-backed ledger store.
//!
//! ## Locking
//!
//! Every store transaction runs at `REPEATABLE READ`. The balance row is the
//! lock: `get_balance_for_update` first inserts a zero placeholder row
//! (`version = 0`) with `ON CONFLICT DO NOTHING`, then selects it `FOR UPDATE`,
//! so even the first movement on a key serialises against concurrent ones.
//! Placeholders are reported as "not found" and hidden from plain reads.
//!
//! A writer queued on the row lock fails with `40001` once the holder commits,
//! because its snapshot predates that commit. While the transaction has done
//! nothing else, the store rolls it back, opens a fresh one and queues again;
//! every round commits one writer, so same-key postings proceed in lock order
//! without spending the service's retry budget.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (serialization failure) | `40001` | `SerializationFailure` |
//! | Database (deadlock detected) | `40P01` | `SerializationFailure` |
//! | Database (lock not available) | `55P03` | `Storage` |
//! | Database (check violation) | `23514` | `InvalidWrite` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / RowNotFound / Other | N/A | `Storage` |

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use stockledger_core::{ProductId, TransactionId, UserId, WarehouseId};
use stockledger_inventory::{
    Balance, BalanceKey, CardEntryDraft, MovementCode, MovementType, Reference, StockCardEntry,
    StockCardFilter, Transaction, TransactionLine, TransferSide,
};

use super::r#trait::{InventoryStore, StoreError, StoreTx};

const SCHEMA: &str = include_str!("../../migrations/0001_inventory_ledger.sql");

/// Postgres-backed transactional ledger store.
///
/// Cheap to clone; all clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn apply_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("apply_schema", e))?;
        Ok(())
    }
}

async fn begin_repeatable_read(pool: &PgPool) -> Result<sqlx::Transaction<'static, Postgres>, StoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_isolation", e))?;

    Ok(tx)
}

#[async_trait]
impl InventoryStore for PostgresInventoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = begin_repeatable_read(&self.pool).await?;

        Ok(Box::new(PostgresStoreTx {
            pool: self.pool.clone(),
            tx: Some(tx),
            locked: HashSet::new(),
            wrote: false,
        }))
    }

    #[instrument(
        skip(self, filter),
        fields(warehouse_id = %filter.warehouse_id, product_id = %filter.product_id),
        err
    )]
    async fn stock_card(
        &self,
        filter: &StockCardFilter,
        limit: u32,
    ) -> Result<Vec<StockCardEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_id, tx_code, tx_type, warehouse_id, product_id, posted_at,
                   qty_in, qty_out, balance_qty, unit_cost, balance_cost, note
            FROM inventory_stock_card
            WHERE warehouse_id = $1
              AND product_id = $2
              AND ($3::timestamptz IS NULL OR posted_at >= $3)
              AND ($4::timestamptz IS NULL OR posted_at <= $4)
            ORDER BY posted_at ASC, id ASC
            LIMIT $5
            "#,
        )
        .bind(filter.warehouse_id.get())
        .bind(filter.product_id.get())
        .bind(filter.from)
        .bind(filter.to)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stock_card", e))?;

        rows.iter().map(card_entry_from_row).collect()
    }

    async fn load_card(&self, key: BalanceKey) -> Result<Vec<StockCardEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_id, tx_code, tx_type, warehouse_id, product_id, posted_at,
                   qty_in, qty_out, balance_qty, unit_cost, balance_cost, note
            FROM inventory_stock_card
            WHERE warehouse_id = $1 AND product_id = $2
            ORDER BY id ASC
            "#,
        )
        .bind(key.warehouse_id.get())
        .bind(key.product_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_card", e))?;

        rows.iter().map(card_entry_from_row).collect()
    }

    async fn balance(&self, key: BalanceKey) -> Result<Option<Balance>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, qty, avg_cost, updated_at, version
            FROM inventory_balances
            WHERE warehouse_id = $1 AND product_id = $2 AND version > 0
            "#,
        )
        .bind(key.warehouse_id.get())
        .bind(key.product_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("balance", e))?;

        row.as_ref().map(balance_from_row).transpose()
    }

    async fn transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<(Transaction, Vec<TransactionLine>)>, StoreError> {
        let header = sqlx::query(
            r#"
            SELECT id, code, tx_type, warehouse_id, ref_module, ref_id, note, posted_at, created_by
            FROM inventory_transactions
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transaction", e))?;

        let Some(header) = header else {
            return Ok(None);
        };
        let header = transaction_from_row(&header)?;

        let lines = sqlx::query(
            r#"
            SELECT transaction_id, line_no, product_id, qty, unit_cost, side
            FROM inventory_transaction_lines
            WHERE transaction_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transaction_lines", e))?;

        let lines = lines.iter().map(line_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(Some((header, lines)))
    }
}

/// One open Postgres transaction. Dropping it unfinished rolls back.
struct PostgresStoreTx {
    pool: Arc<PgPool>,
    tx: Option<sqlx::Transaction<'static, Postgres>>,
    locked: HashSet<BalanceKey>,
    /// Set once anything besides lock acquisition ran in this transaction.
    wrote: bool,
}

impl PostgresStoreTx {
    fn open(&mut self) -> Result<&mut sqlx::Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::Finished)
    }

    /// Replace the (aborted) transaction with a fresh snapshot.
    async fn restart(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                debug!(error = %e, "rollback of aborted transaction failed");
            }
        }
        self.tx = Some(begin_repeatable_read(&self.pool).await?);
        Ok(())
    }

    async fn lock_balance_row(&mut self, key: BalanceKey) -> Result<PgRow, StoreError> {
        let tx = self.open()?;

        sqlx::query(
            r#"
            INSERT INTO inventory_balances (warehouse_id, product_id, qty, avg_cost, version)
            VALUES ($1, $2, 0, 0, 0)
            ON CONFLICT (warehouse_id, product_id) DO NOTHING
            "#,
        )
        .bind(key.warehouse_id.get())
        .bind(key.product_id.get())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_balance_placeholder", e))?;

        sqlx::query(
            r#"
            SELECT warehouse_id, product_id, qty, avg_cost, updated_at, version
            FROM inventory_balances
            WHERE warehouse_id = $1 AND product_id = $2
            FOR UPDATE
            "#,
        )
        .bind(key.warehouse_id.get())
        .bind(key.product_id.get())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_balance", e))
    }
}

#[async_trait]
impl StoreTx for PostgresStoreTx {
    async fn get_balance_for_update(
        &mut self,
        key: BalanceKey,
    ) -> Result<Option<Balance>, StoreError> {
        let mut restarts = 0u32;
        let row = loop {
            match self.lock_balance_row(key).await {
                Err(StoreError::SerializationFailure(msg)) if self.locked.is_empty() && !self.wrote => {
                    restarts += 1;
                    debug!(%key, restarts, reason = %msg, "balance changed while queued on its lock; retaking snapshot");
                    self.restart().await?;
                }
                other => break other?,
            }
        };

        self.locked.insert(key);

        let balance = balance_from_row(&row)?;
        if balance.version == 0 {
            debug!(%key, "balance placeholder locked");
            Ok(None)
        } else {
            Ok(Some(balance))
        }
    }

    async fn insert_transaction(&mut self, header: &Transaction) -> Result<(), StoreError> {
        self.wrote = true;
        let tx = self.open()?;

        sqlx::query(
            r#"
            INSERT INTO inventory_transactions (
                id, code, tx_type, warehouse_id, ref_module, ref_id, note, posted_at, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(header.id.as_uuid())
        .bind(header.code.as_str())
        .bind(header.tx_type.as_str())
        .bind(header.warehouse_id.get())
        .bind(header.reference.module.as_deref())
        .bind(header.reference.id)
        .bind(header.note.as_deref())
        .bind(header.posted_at)
        .bind(header.created_by.map(|u| *u.as_uuid()))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transaction", e))?;

        Ok(())
    }

    async fn insert_transaction_lines(&mut self, lines: &[TransactionLine]) -> Result<(), StoreError> {
        self.wrote = true;
        let tx = self.open()?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO inventory_transaction_lines (
                    transaction_id, line_no, product_id, qty, unit_cost, side
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(line.transaction_id.as_uuid())
            .bind(line.line_no as i32)
            .bind(line.product_id.get())
            .bind(line.qty)
            .bind(line.unit_cost)
            .bind(line.side.map(TransferSide::as_str))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_transaction_line", e))?;
        }

        Ok(())
    }

    async fn upsert_balance(&mut self, balance: &Balance) -> Result<(), StoreError> {
        if !self.locked.contains(&balance.key) {
            return Err(StoreError::InvalidWrite(format!(
                "balance ({}) written without holding its lock",
                balance.key
            )));
        }
        self.wrote = true;
        let tx = self.open()?;

        sqlx::query(
            r#"
            INSERT INTO inventory_balances (warehouse_id, product_id, qty, avg_cost, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (warehouse_id, product_id)
            DO UPDATE SET
                qty = EXCLUDED.qty,
                avg_cost = EXCLUDED.avg_cost,
                updated_at = EXCLUDED.updated_at,
                version = EXCLUDED.version
            "#,
        )
        .bind(balance.key.warehouse_id.get())
        .bind(balance.key.product_id.get())
        .bind(balance.qty)
        .bind(balance.avg_cost)
        .bind(balance.updated_at)
        .bind(balance.version as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_balance", e))?;

        Ok(())
    }

    async fn insert_card_entry(&mut self, draft: CardEntryDraft) -> Result<StockCardEntry, StoreError> {
        self.wrote = true;
        let tx = self.open()?;

        let row = sqlx::query(
            r#"
            INSERT INTO inventory_stock_card (
                transaction_id, tx_code, tx_type, warehouse_id, product_id, posted_at,
                qty_in, qty_out, balance_qty, unit_cost, balance_cost, note
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(draft.transaction_id.as_uuid())
        .bind(draft.tx_code.as_str())
        .bind(draft.tx_type.as_str())
        .bind(draft.warehouse_id.get())
        .bind(draft.product_id.get())
        .bind(draft.posted_at)
        .bind(draft.qty_in)
        .bind(draft.qty_out)
        .bind(draft.balance_qty)
        .bind(draft.unit_cost)
        .bind(draft.balance_cost)
        .bind(draft.note.as_deref())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_card_entry", e))?;

        let id: i64 = row.try_get("id").map_err(|e| decode_error("id", e))?;
        Ok(draft.into_entry(id as u64))
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::Finished)?;
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("40001") | Some("40P01") => StoreError::SerializationFailure(msg),
                Some("23514") => StoreError::InvalidWrite(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Storage(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_error(column: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(format!("failed to decode column {}: {}", column, err))
}

// Row decoding

fn balance_from_row(row: &PgRow) -> Result<Balance, StoreError> {
    let warehouse_id: i64 = row.try_get("warehouse_id").map_err(|e| decode_error("warehouse_id", e))?;
    let product_id: i64 = row.try_get("product_id").map_err(|e| decode_error("product_id", e))?;
    let qty: Decimal = row.try_get("qty").map_err(|e| decode_error("qty", e))?;
    let avg_cost: Decimal = row.try_get("avg_cost").map_err(|e| decode_error("avg_cost", e))?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(|e| decode_error("updated_at", e))?;
    let version: i64 = row.try_get("version").map_err(|e| decode_error("version", e))?;

    Ok(Balance {
        key: BalanceKey::new(WarehouseId::new(warehouse_id), ProductId::new(product_id)),
        qty,
        avg_cost,
        updated_at,
        version: version as u64,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction, StoreError> {
    let id: Uuid = row.try_get("id").map_err(|e| decode_error("id", e))?;
    let code: String = row.try_get("code").map_err(|e| decode_error("code", e))?;
    let tx_type: String = row.try_get("tx_type").map_err(|e| decode_error("tx_type", e))?;
    let warehouse_id: i64 = row.try_get("warehouse_id").map_err(|e| decode_error("warehouse_id", e))?;
    let ref_module: Option<String> = row.try_get("ref_module").map_err(|e| decode_error("ref_module", e))?;
    let ref_id: Option<Uuid> = row.try_get("ref_id").map_err(|e| decode_error("ref_id", e))?;
    let note: Option<String> = row.try_get("note").map_err(|e| decode_error("note", e))?;
    let posted_at: DateTime<Utc> = row.try_get("posted_at").map_err(|e| decode_error("posted_at", e))?;
    let created_by: Option<Uuid> = row.try_get("created_by").map_err(|e| decode_error("created_by", e))?;

    Ok(Transaction {
        id: TransactionId::from_uuid(id),
        code: MovementCode::from_stored(code),
        tx_type: tx_type
            .parse::<MovementType>()
            .map_err(|e| decode_error("tx_type", e))?,
        warehouse_id: WarehouseId::new(warehouse_id),
        reference: Reference {
            module: ref_module,
            id: ref_id,
        },
        note,
        posted_at,
        created_by: created_by.map(UserId::from_uuid),
    })
}

fn line_from_row(row: &PgRow) -> Result<TransactionLine, StoreError> {
    let transaction_id: Uuid = row.try_get("transaction_id").map_err(|e| decode_error("transaction_id", e))?;
    let line_no: i32 = row.try_get("line_no").map_err(|e| decode_error("line_no", e))?;
    let product_id: i64 = row.try_get("product_id").map_err(|e| decode_error("product_id", e))?;
    let side: Option<String> = row.try_get("side").map_err(|e| decode_error("side", e))?;

    Ok(TransactionLine {
        transaction_id: TransactionId::from_uuid(transaction_id),
        line_no: line_no as u32,
        product_id: ProductId::new(product_id),
        qty: row.try_get("qty").map_err(|e| decode_error("qty", e))?,
        unit_cost: row.try_get("unit_cost").map_err(|e| decode_error("unit_cost", e))?,
        side: side
            .map(|s| s.parse::<TransferSide>())
            .transpose()
            .map_err(|e| decode_error("side", e))?,
    })
}

fn card_entry_from_row(row: &PgRow) -> Result<StockCardEntry, StoreError> {
    let id: i64 = row.try_get("id").map_err(|e| decode_error("id", e))?;
    let transaction_id: Uuid = row.try_get("transaction_id").map_err(|e| decode_error("transaction_id", e))?;
    let tx_code: String = row.try_get("tx_code").map_err(|e| decode_error("tx_code", e))?;
    let tx_type: String = row.try_get("tx_type").map_err(|e| decode_error("tx_type", e))?;
    let warehouse_id: i64 = row.try_get("warehouse_id").map_err(|e| decode_error("warehouse_id", e))?;
    let product_id: i64 = row.try_get("product_id").map_err(|e| decode_error("product_id", e))?;

    Ok(StockCardEntry {
        id: id as u64,
        transaction_id: TransactionId::from_uuid(transaction_id),
        tx_code: MovementCode::from_stored(tx_code),
        tx_type: tx_type
            .parse::<MovementType>()
            .map_err(|e| decode_error("tx_type", e))?,
        warehouse_id: WarehouseId::new(warehouse_id),
        product_id: ProductId::new(product_id),
        posted_at: row.try_get("posted_at").map_err(|e| decode_error("posted_at", e))?,
        qty_in: row.try_get("qty_in").map_err(|e| decode_error("qty_in", e))?,
        qty_out: row.try_get("qty_out").map_err(|e| decode_error("qty_out", e))?,
        balance_qty: row.try_get("balance_qty").map_err(|e| decode_error("balance_qty", e))?,
        unit_cost: row.try_get("unit_cost").map_err(|e| decode_error("unit_cost", e))?,
        balance_cost: row.try_get("balance_cost").map_err(|e| decode_error("balance_cost", e))?,
        note: row.try_get("note").map_err(|e| decode_error("note", e))?,
    })
}
