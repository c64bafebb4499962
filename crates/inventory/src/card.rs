//! Append-only stock card.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, Entity, ProductId, TransactionId, WarehouseId};

use crate::balance::{AppliedMovement, BalanceKey};
use crate::movement::{MovementCode, MovementType};
use crate::transaction::Transaction;

/// One committed movement on one `(warehouse, product)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCardEntry {
    /// Insertion sequence assigned by the store; breaks `posted_at` ties.
    pub id: u64,
    pub transaction_id: TransactionId,
    pub tx_code: MovementCode,
    pub tx_type: MovementType,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub posted_at: DateTime<Utc>,
    pub qty_in: Decimal,
    pub qty_out: Decimal,
    /// Running quantity after this movement.
    pub balance_qty: Decimal,
    /// Unit cost the movement was valued at.
    pub unit_cost: Decimal,
    /// Running average unit cost after this movement.
    pub balance_cost: Decimal,
    pub note: Option<String>,
}

impl StockCardEntry {
    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.warehouse_id, self.product_id)
    }

    /// Signed quantity delta of the movement.
    pub fn delta(&self) -> Decimal {
        self.qty_in - self.qty_out
    }
}

impl Entity for StockCardEntry {
    type Id = u64;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// A card entry before the store has assigned its sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardEntryDraft {
    pub transaction_id: TransactionId,
    pub tx_code: MovementCode,
    pub tx_type: MovementType,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub posted_at: DateTime<Utc>,
    pub qty_in: Decimal,
    pub qty_out: Decimal,
    pub balance_qty: Decimal,
    pub unit_cost: Decimal,
    pub balance_cost: Decimal,
    pub note: Option<String>,
}

impl CardEntryDraft {
    pub fn for_movement(header: &Transaction, applied: &AppliedMovement) -> Self {
        Self {
            transaction_id: header.id,
            tx_code: header.code.clone(),
            tx_type: header.tx_type,
            warehouse_id: applied.balance.key.warehouse_id,
            product_id: applied.balance.key.product_id,
            posted_at: header.posted_at,
            qty_in: applied.qty_in,
            qty_out: applied.qty_out,
            balance_qty: applied.balance.qty,
            unit_cost: applied.unit_cost,
            balance_cost: applied.balance.avg_cost,
            note: header.note.clone(),
        }
    }

    pub fn into_entry(self, id: u64) -> StockCardEntry {
        StockCardEntry {
            id,
            transaction_id: self.transaction_id,
            tx_code: self.tx_code,
            tx_type: self.tx_type,
            warehouse_id: self.warehouse_id,
            product_id: self.product_id,
            posted_at: self.posted_at,
            qty_in: self.qty_in,
            qty_out: self.qty_out,
            balance_qty: self.balance_qty,
            unit_cost: self.unit_cost,
            balance_cost: self.balance_cost,
            note: self.note,
        }
    }
}

/// Stock card query: one key, optional inclusive time window, bounded page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCardFilter {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl StockCardFilter {
    pub fn new(warehouse_id: WarehouseId, product_id: ProductId) -> Self {
        Self {
            warehouse_id,
            product_id,
            from: None,
            to: None,
            limit: None,
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn key(&self) -> BalanceKey {
        BalanceKey::new(self.warehouse_id, self.product_id)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        self.warehouse_id.ensure_valid()?;
        self.product_id.ensure_valid()?;
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(DomainError::validation("stock card window starts after it ends"));
            }
        }
        Ok(())
    }

    /// Page size after applying the default (missing or zero) and the cap.
    pub fn effective_limit(&self, default_limit: u32, max_limit: u32) -> u32 {
        match self.limit {
            None | Some(0) => default_limit.min(max_limit),
            Some(n) => n.min(max_limit),
        }
    }

    pub fn matches(&self, entry: &StockCardEntry) -> bool {
        entry.warehouse_id == self.warehouse_id
            && entry.product_id == self.product_id
            && self.from.is_none_or(|from| entry.posted_at >= from)
            && self.to.is_none_or(|to| entry.posted_at <= to)
    }
}

/// Chronological order: `posted_at` ascending, then insertion sequence.
pub fn sort_chronologically(entries: &mut [StockCardEntry]) {
    entries.sort_by(|a, b| a.posted_at.cmp(&b.posted_at).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn entry(id: u64, posted_at: DateTime<Utc>) -> StockCardEntry {
        StockCardEntry {
            id,
            transaction_id: TransactionId::new(),
            tx_code: MovementCode::from_stored(format!("C-{id}")),
            tx_type: MovementType::In,
            warehouse_id: WarehouseId::new(1),
            product_id: ProductId::new(1),
            posted_at,
            qty_in: dec!(1),
            qty_out: Decimal::ZERO,
            balance_qty: dec!(1),
            unit_cost: dec!(10),
            balance_cost: dec!(10),
            note: None,
        }
    }

    #[test]
    fn chronological_sort_breaks_ties_by_insertion() {
        let t0 = Utc::now();
        let mut entries = vec![entry(3, t0), entry(1, t0 + Duration::seconds(1)), entry(2, t0)];
        sort_chronologically(&mut entries);

        let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let t0 = Utc::now();
        let filter = StockCardFilter::new(WarehouseId::new(1), ProductId::new(1))
            .between(t0, t0 + Duration::minutes(5));

        assert!(filter.matches(&entry(1, t0)));
        assert!(filter.matches(&entry(2, t0 + Duration::minutes(5))));
        assert!(!filter.matches(&entry(3, t0 - Duration::seconds(1))));
    }

    #[test]
    fn limit_defaults_and_caps() {
        let filter = StockCardFilter::new(WarehouseId::new(1), ProductId::new(1));
        assert_eq!(filter.effective_limit(200, 1000), 200);
        assert_eq!(filter.clone().with_limit(0).effective_limit(200, 1000), 200);
        assert_eq!(filter.clone().with_limit(5).effective_limit(200, 1000), 5);
        assert_eq!(filter.with_limit(50_000).effective_limit(200, 1000), 1000);
    }

    #[test]
    fn inverted_window_is_rejected() {
        let t0 = Utc::now();
        let filter = StockCardFilter::new(WarehouseId::new(1), ProductId::new(1))
            .between(t0, t0 - Duration::seconds(1));
        assert!(filter.validate().is_err());
    }
}
