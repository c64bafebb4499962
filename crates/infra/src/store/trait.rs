use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use stockledger_core::TransactionId;
use stockledger_inventory::{
    Balance, BalanceKey, CardEntryDraft, StockCardEntry, StockCardFilter, Transaction,
    TransactionLine,
};

/// Storage-level failure.
///
/// These are **infrastructure errors** (locking, uniqueness, connectivity) as
/// opposed to domain errors (validation, negative stock).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write (e.g. duplicate transaction code).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The balance lock could not be acquired in time.
    #[error("timed out waiting for balance lock ({0})")]
    LockTimeout(BalanceKey),

    /// The database aborted the transaction to preserve isolation; safe to retry.
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// The write violates the transaction protocol (e.g. balance not locked).
    #[error("invalid write: {0}")]
    InvalidWrite(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    Finished,

    /// Connectivity, decoding and any other backend failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Whether re-running the whole transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::SerializationFailure(_))
    }
}

/// Transactional store for the inventory ledger.
///
/// ## Tables
///
/// - transaction headers (unique `code`)
/// - transaction lines
/// - balances, unique per `(warehouse_id, product_id)`; the only mutable rows
/// - the append-only stock card
///
/// ## Write path
///
/// Every movement runs inside one [`StoreTx`] obtained from [`begin`]. The
/// transaction locks the balance row first, then inserts header, lines, the
/// new balance and the card entry, then commits. Either everything commits or
/// nothing does.
///
/// ## Read path
///
/// Reads (`stock_card`, `balance`, ...) never take the balance lock.
///
/// [`begin`]: InventoryStore::begin
#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Open a transaction (repeatable-read or stronger).
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    /// Card entries matching the filter, `posted_at` ascending then insertion
    /// order, at most `limit` rows.
    async fn stock_card(
        &self,
        filter: &StockCardFilter,
        limit: u32,
    ) -> Result<Vec<StockCardEntry>, StoreError>;

    /// Full card of one key in commit (insertion) order.
    async fn load_card(&self, key: BalanceKey) -> Result<Vec<StockCardEntry>, StoreError>;

    /// Current materialised balance, without locking.
    async fn balance(&self, key: BalanceKey) -> Result<Option<Balance>, StoreError>;

    /// Transaction header and its lines.
    async fn transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<(Transaction, Vec<TransactionLine>)>, StoreError>;
}

/// One open store transaction.
///
/// Dropping an unfinished transaction rolls it back and releases its locks.
#[async_trait]
pub trait StoreTx: Send {
    /// Lock the balance row for `key` until the transaction ends.
    ///
    /// Blocks while another transaction holds the same key. Returns `Ok(None)`
    /// for a key that has never moved.
    async fn get_balance_for_update(
        &mut self,
        key: BalanceKey,
    ) -> Result<Option<Balance>, StoreError>;

    async fn insert_transaction(&mut self, header: &Transaction) -> Result<(), StoreError>;

    async fn insert_transaction_lines(&mut self, lines: &[TransactionLine]) -> Result<(), StoreError>;

    /// Insert or replace the balance row. The key must be locked by this transaction.
    async fn upsert_balance(&mut self, balance: &Balance) -> Result<(), StoreError>;

    /// Append a card entry, assigning its insertion sequence.
    async fn insert_card_entry(&mut self, draft: CardEntryDraft) -> Result<StockCardEntry, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        (**self).begin().await
    }

    async fn stock_card(
        &self,
        filter: &StockCardFilter,
        limit: u32,
    ) -> Result<Vec<StockCardEntry>, StoreError> {
        (**self).stock_card(filter, limit).await
    }

    async fn load_card(&self, key: BalanceKey) -> Result<Vec<StockCardEntry>, StoreError> {
        (**self).load_card(key).await
    }

    async fn balance(&self, key: BalanceKey) -> Result<Option<Balance>, StoreError> {
        (**self).balance(key).await
    }

    async fn transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<(Transaction, Vec<TransactionLine>)>, StoreError> {
        (**self).transaction(id).await
    }
}
