use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as KeyMutex, OwnedMutexGuard};

use stockledger_core::TransactionId;
use stockledger_inventory::{
    Balance, BalanceKey, CardEntryDraft, StockCardEntry, StockCardFilter, Transaction,
    TransactionLine, sort_chronologically,
};

use super::r#trait::{InventoryStore, StoreError, StoreTx};
use crate::config::LedgerConfig;

#[derive(Debug, Default)]
struct Tables {
    transactions: HashMap<TransactionId, Transaction>,
    codes: HashSet<String>,
    lines: HashMap<TransactionId, Vec<TransactionLine>>,
    balances: HashMap<BalanceKey, Balance>,
    card: Vec<StockCardEntry>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    key_locks: Mutex<HashMap<BalanceKey, Arc<KeyMutex<()>>>>,
    card_seq: AtomicU64,
}

impl Shared {
    fn key_lock(&self, key: BalanceKey) -> Result<Arc<KeyMutex<()>>, StoreError> {
        let mut locks = self.key_locks.lock().map_err(|_| poisoned())?;
        Ok(locks.entry(key).or_default().clone())
    }

    /// Drop lock entries nobody holds or waits on, so the map tracks only
    /// keys in use rather than every key ever touched.
    fn prune_key_locks(&self, keys: &[BalanceKey]) {
        let Ok(mut locks) = self.key_locks.lock() else {
            return;
        };
        for key in keys {
            if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(key);
            }
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

/// In-memory transactional ledger store.
///
/// Intended for tests/dev and single-process deployments. Each balance key
/// has its own async mutex standing in for a row lock; a transaction holds
/// the owned guard until it commits, rolls back or is dropped. Writes are
/// staged in the transaction and applied to the tables in one step at commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryStore {
    shared: Arc<Shared>,
    lock_timeout: Option<Duration>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store honouring the configured lock timeout.
    pub fn from_config(config: &LedgerConfig) -> Self {
        match config.lock_timeout {
            Some(timeout) => Self::new().with_lock_timeout(timeout),
            None => Self::new(),
        }
    }

    /// Fail `get_balance_for_update` with [`StoreError::LockTimeout`] instead of
    /// waiting indefinitely.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Number of committed transaction headers.
    pub fn transaction_count(&self) -> usize {
        self.shared
            .tables
            .read()
            .map(|t| t.transactions.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn tracked_key_locks(&self) -> usize {
        self.shared.key_locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn read_tables(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.shared.tables.read().map_err(|_| poisoned())
    }
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(InMemoryStoreTx {
            shared: self.shared.clone(),
            lock_timeout: self.lock_timeout,
            held: HashMap::new(),
            staged: Staged::default(),
            finished: false,
        }))
    }

    async fn stock_card(
        &self,
        filter: &StockCardFilter,
        limit: u32,
    ) -> Result<Vec<StockCardEntry>, StoreError> {
        let mut entries: Vec<StockCardEntry> = self
            .read_tables()?
            .card
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        sort_chronologically(&mut entries);
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn load_card(&self, key: BalanceKey) -> Result<Vec<StockCardEntry>, StoreError> {
        let mut entries: Vec<StockCardEntry> = self
            .read_tables()?
            .card
            .iter()
            .filter(|e| e.key() == key)
            .cloned()
            .collect();

        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }

    async fn balance(&self, key: BalanceKey) -> Result<Option<Balance>, StoreError> {
        Ok(self.read_tables()?.balances.get(&key).cloned())
    }

    async fn transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<(Transaction, Vec<TransactionLine>)>, StoreError> {
        let tables = self.read_tables()?;
        Ok(tables.transactions.get(&id).map(|header| {
            let lines = tables.lines.get(&id).cloned().unwrap_or_default();
            (header.clone(), lines)
        }))
    }
}

#[derive(Debug, Default)]
struct Staged {
    transactions: Vec<Transaction>,
    lines: Vec<TransactionLine>,
    balances: HashMap<BalanceKey, Balance>,
    card: Vec<StockCardEntry>,
}

struct InMemoryStoreTx {
    shared: Arc<Shared>,
    lock_timeout: Option<Duration>,
    held: HashMap<BalanceKey, OwnedMutexGuard<()>>,
    staged: Staged,
    finished: bool,
}

impl InMemoryStoreTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::Finished)
        } else {
            Ok(())
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.staged = Staged::default();
        self.release_locks();
    }

    fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys: Vec<BalanceKey> = self.held.keys().copied().collect();
        self.held.clear();
        self.shared.prune_key_locks(&keys);
    }

    fn current_balance(&self, key: BalanceKey) -> Result<Option<Balance>, StoreError> {
        if let Some(staged) = self.staged.balances.get(&key) {
            return Ok(Some(staged.clone()));
        }
        let tables = self.shared.tables.read().map_err(|_| poisoned())?;
        Ok(tables.balances.get(&key).cloned())
    }
}

impl Drop for InMemoryStoreTx {
    fn drop(&mut self) {
        self.release_locks();
    }
}

#[async_trait]
impl StoreTx for InMemoryStoreTx {
    async fn get_balance_for_update(
        &mut self,
        key: BalanceKey,
    ) -> Result<Option<Balance>, StoreError> {
        self.ensure_open()?;

        if !self.held.contains_key(&key) {
            let lock = self.shared.key_lock(key)?;
            let guard = match self.lock_timeout {
                Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                    .await
                    .map_err(|_| StoreError::LockTimeout(key))?,
                None => lock.lock_owned().await,
            };
            self.held.insert(key, guard);
        }

        self.current_balance(key)
    }

    async fn insert_transaction(&mut self, header: &Transaction) -> Result<(), StoreError> {
        self.ensure_open()?;

        let code = header.code.as_str();
        let staged_dup = self.staged.transactions.iter().any(|t| t.code.as_str() == code);
        let committed_dup = self
            .shared
            .tables
            .read()
            .map_err(|_| poisoned())?
            .codes
            .contains(code);
        if staged_dup || committed_dup {
            return Err(StoreError::Conflict(format!("transaction code '{code}' already exists")));
        }

        self.staged.transactions.push(header.clone());
        Ok(())
    }

    async fn insert_transaction_lines(&mut self, lines: &[TransactionLine]) -> Result<(), StoreError> {
        self.ensure_open()?;

        for line in lines {
            if !self.staged.transactions.iter().any(|t| t.id == line.transaction_id) {
                return Err(StoreError::InvalidWrite(format!(
                    "line {} references unknown transaction {}",
                    line.line_no, line.transaction_id
                )));
            }
        }
        self.staged.lines.extend_from_slice(lines);
        Ok(())
    }

    async fn upsert_balance(&mut self, balance: &Balance) -> Result<(), StoreError> {
        self.ensure_open()?;

        if !self.held.contains_key(&balance.key) {
            return Err(StoreError::InvalidWrite(format!(
                "balance ({}) written without holding its lock",
                balance.key
            )));
        }
        self.staged.balances.insert(balance.key, balance.clone());
        Ok(())
    }

    async fn insert_card_entry(&mut self, draft: CardEntryDraft) -> Result<StockCardEntry, StoreError> {
        self.ensure_open()?;

        let id = self.shared.card_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = draft.into_entry(id);
        self.staged.card.push(entry.clone());
        Ok(entry)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;

        {
            let mut tables = self.shared.tables.write().map_err(|_| poisoned())?;

            // Re-check under the write lock: another transaction may have
            // committed the same code after our insert.
            if let Some(dup) = self
                .staged
                .transactions
                .iter()
                .find(|t| tables.codes.contains(t.code.as_str()))
            {
                let code = dup.code.to_string();
                drop(tables);
                self.finish();
                return Err(StoreError::Conflict(format!(
                    "transaction code '{code}' already exists"
                )));
            }

            let staged = std::mem::take(&mut self.staged);
            for header in staged.transactions {
                tables.codes.insert(header.code.to_string());
                tables.transactions.insert(header.id, header);
            }
            for line in staged.lines {
                tables.lines.entry(line.transaction_id).or_default().push(line);
            }
            tables.balances.extend(staged.balances);
            tables.card.extend(staged.card);
        }

        self.finish();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use stockledger_core::{ProductId, WarehouseId};
    use stockledger_inventory::{CostingPolicy, MovementCode, MovementType, Reference};

    fn key(wh: i64) -> BalanceKey {
        BalanceKey::new(WarehouseId::new(wh), ProductId::new(1))
    }

    fn header(code: &str, wh: i64) -> Transaction {
        Transaction {
            id: TransactionId::new(),
            code: MovementCode::from_stored(code),
            tx_type: MovementType::In,
            warehouse_id: WarehouseId::new(wh),
            reference: Reference::default(),
            note: None,
            posted_at: Utc::now(),
            created_by: None,
        }
    }

    async fn write_inbound(
        tx: &mut dyn StoreTx,
        code: &str,
        wh: i64,
        qty: Decimal,
    ) -> Result<StockCardEntry, StoreError> {
        let current = tx
            .get_balance_for_update(key(wh))
            .await?
            .unwrap_or_else(|| Balance::empty(key(wh), Utc::now()));
        let applied = current
            .apply(qty, dec!(10), &CostingPolicy::default(), Utc::now())
            .map_err(|e| StoreError::InvalidWrite(e.to_string()))?;
        let h = header(code, wh);
        tx.insert_transaction(&h).await?;
        tx.insert_transaction_lines(&[TransactionLine {
            transaction_id: h.id,
            line_no: 1,
            product_id: ProductId::new(1),
            qty,
            unit_cost: dec!(10),
            side: None,
        }])
        .await?;
        tx.upsert_balance(&applied.balance).await?;
        tx.insert_card_entry(CardEntryDraft::for_movement(&h, &applied)).await
    }

    #[tokio::test]
    async fn commit_makes_all_rows_visible() {
        let store = InMemoryInventoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let entry = write_inbound(tx.as_mut(), "GRN-1", 1, dec!(4)).await.unwrap();

        assert_eq!(store.balance(key(1)).await.unwrap(), None);
        tx.commit().await.unwrap();

        let balance = store.balance(key(1)).await.unwrap().unwrap();
        assert_eq!(balance.qty, dec!(4));
        let (header, lines) = store.transaction(entry.transaction_id).await.unwrap().unwrap();
        assert_eq!(header.code.as_str(), "GRN-1");
        assert_eq!(lines.len(), 1);
        assert_eq!(store.load_card(key(1)).await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn rollback_and_drop_discard_staged_rows() {
        let store = InMemoryInventoryStore::new();

        let mut tx = store.begin().await.unwrap();
        write_inbound(tx.as_mut(), "GRN-1", 1, dec!(4)).await.unwrap();
        tx.rollback().await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            write_inbound(tx.as_mut(), "GRN-2", 1, dec!(4)).await.unwrap();
        }

        assert_eq!(store.transaction_count(), 0);
        assert!(store.load_card(key(1)).await.unwrap().is_empty());

        // Locks were released: a new transaction can take the key.
        let mut tx = store.begin().await.unwrap();
        write_inbound(tx.as_mut(), "GRN-3", 1, dec!(1)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.balance(key(1)).await.unwrap().unwrap().qty, dec!(1));
    }

    #[tokio::test]
    async fn duplicate_code_is_a_conflict() {
        let store = InMemoryInventoryStore::new();
        let mut tx = store.begin().await.unwrap();
        write_inbound(tx.as_mut(), "GRN-1", 1, dec!(1)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = write_inbound(tx.as_mut(), "GRN-1", 2, dec!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn balance_lock_blocks_second_transaction() {
        let store = InMemoryInventoryStore::new().with_lock_timeout(Duration::from_millis(50));

        let mut first = store.begin().await.unwrap();
        first.get_balance_for_update(key(1)).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let err = second.get_balance_for_update(key(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(k) if k == key(1)));

        // Other keys are independent.
        second.get_balance_for_update(key(2)).await.unwrap();

        first.rollback().await.unwrap();
        second.get_balance_for_update(key(1)).await.unwrap();
    }

    #[tokio::test]
    async fn released_key_locks_are_pruned() {
        let store = InMemoryInventoryStore::new();

        for wh in 1..=3 {
            let mut tx = store.begin().await.unwrap();
            write_inbound(tx.as_mut(), &format!("GRN-{wh}"), wh, dec!(1)).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(store.tracked_key_locks(), 0);

        let mut first = store.begin().await.unwrap();
        first.get_balance_for_update(key(1)).await.unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut second = store.begin().await.unwrap();
                second.get_balance_for_update(key(1)).await.unwrap();
                second.rollback().await.unwrap();
            })
        };
        tokio::task::yield_now().await;

        // The waiter still needs the entry.
        first.rollback().await.unwrap();
        assert!(store.tracked_key_locks() <= 1);

        waiter.await.unwrap();
        {
            let mut dropped = store.begin().await.unwrap();
            dropped.get_balance_for_update(key(2)).await.unwrap();
        }
        assert_eq!(store.tracked_key_locks(), 0);
    }

    #[tokio::test]
    async fn upsert_without_lock_is_rejected() {
        let store = InMemoryInventoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .upsert_balance(&Balance::empty(key(1), Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidWrite(_)));
    }

    #[tokio::test]
    async fn finished_transaction_rejects_further_use() {
        let store = InMemoryInventoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Finished)));
    }
}
