//! Rebuild a balance from its stock card.
//!
//! The card is the durable source of truth; replaying it in commit order must
//! reproduce the stored balance exactly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::balance::{Balance, BalanceKey, CostingError, CostingPolicy};
use crate::card::StockCardEntry;

/// Replay entries for one key. Entries must be in commit (insertion) order.
///
/// Entries of other keys are skipped. Negative intermediate balances are
/// accepted because they were accepted when committed.
pub fn replay_balance<'a>(
    key: BalanceKey,
    entries: impl IntoIterator<Item = &'a StockCardEntry>,
    policy: &CostingPolicy,
    at: DateTime<Utc>,
) -> Result<Balance, CostingError> {
    let replay_policy = CostingPolicy {
        allow_negative_stock: true,
        ..policy.clone()
    };

    let mut balance = Balance::empty(key, at);
    for entry in entries.into_iter().filter(|e| e.key() == key) {
        let applied = balance.apply(entry.delta(), entry.unit_cost, &replay_policy, entry.posted_at)?;
        balance = applied.balance;
    }
    Ok(balance)
}

/// Stored balance compared against a replay of its card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceReconciliation {
    pub key: BalanceKey,
    pub stored_qty: Decimal,
    pub stored_avg_cost: Decimal,
    pub replayed_qty: Decimal,
    pub replayed_avg_cost: Decimal,
    pub movements: u64,
}

impl BalanceReconciliation {
    pub fn new(key: BalanceKey, stored: Option<&Balance>, replayed: &Balance) -> Self {
        Self {
            key,
            stored_qty: stored.map(|b| b.qty).unwrap_or(Decimal::ZERO),
            stored_avg_cost: stored.map(|b| b.avg_cost).unwrap_or(Decimal::ZERO),
            replayed_qty: replayed.qty,
            replayed_avg_cost: replayed.avg_cost,
            movements: replayed.version,
        }
    }

    pub fn qty_drift(&self) -> Decimal {
        self.stored_qty - self.replayed_qty
    }

    pub fn avg_cost_drift(&self) -> Decimal {
        self.stored_avg_cost - self.replayed_avg_cost
    }

    pub fn is_consistent(&self) -> bool {
        self.qty_drift().is_zero() && self.avg_cost_drift().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::CardEntryDraft;
    use crate::movement::{MovementCode, MovementType};
    use crate::transaction::{Reference, Transaction};
    use rust_decimal_macros::dec;
    use stockledger_core::{ProductId, TransactionId, WarehouseId};

    fn key() -> BalanceKey {
        BalanceKey::new(WarehouseId::new(4), ProductId::new(2))
    }

    fn commit(
        balance: &Balance,
        delta: Decimal,
        cost: Decimal,
        policy: &CostingPolicy,
        seq: u64,
    ) -> (Balance, StockCardEntry) {
        let header = Transaction {
            id: TransactionId::new(),
            code: MovementCode::from_stored(format!("T-{seq}")),
            tx_type: MovementType::Adjust,
            warehouse_id: key().warehouse_id,
            reference: Reference::default(),
            note: None,
            posted_at: Utc::now(),
            created_by: None,
        };
        let applied = balance.apply(delta, cost, policy, header.posted_at).unwrap();
        let entry = CardEntryDraft::for_movement(&header, &applied).into_entry(seq);
        (applied.balance, entry)
    }

    #[test]
    fn replay_reproduces_committed_balance() {
        let policy = CostingPolicy::default();
        let mut balance = Balance::empty(key(), Utc::now());
        let mut card = Vec::new();

        for (seq, (delta, cost)) in [
            (dec!(10), dec!(100000)),
            (dec!(5), dec!(120000)),
            (dec!(-8), Decimal::ZERO),
            (dec!(2.5), dec!(99999.99)),
        ]
        .into_iter()
        .enumerate()
        {
            let (next, entry) = commit(&balance, delta, cost, &policy, seq as u64 + 1);
            balance = next;
            card.push(entry);
        }

        let replayed = replay_balance(key(), &card, &policy, Utc::now()).unwrap();
        let rec = BalanceReconciliation::new(key(), Some(&balance), &replayed);

        assert!(rec.is_consistent(), "{rec:?}");
        assert_eq!(rec.movements, 4);
        assert_eq!(replayed.qty, dec!(9.5));
    }

    #[test]
    fn replay_after_negative_stock_uses_receipt_cost() {
        let lenient = CostingPolicy {
            allow_negative_stock: true,
            ..CostingPolicy::default()
        };
        let (short, e1) = commit(&Balance::empty(key(), Utc::now()), dec!(-5), Decimal::ZERO, &lenient, 1);
        let (balance, e2) = commit(&short, dec!(3), dec!(10), &lenient, 2);
        assert_eq!((balance.qty, balance.avg_cost), (dec!(-2), dec!(10)));

        // Replay accepts the negative interim even under the strict policy.
        let replayed = replay_balance(key(), [&e1, &e2], &CostingPolicy::default(), Utc::now()).unwrap();
        let rec = BalanceReconciliation::new(key(), Some(&balance), &replayed);

        assert!(rec.is_consistent(), "{rec:?}");
        assert_eq!(replayed.avg_cost, dec!(10));
    }

    #[test]
    fn drift_is_reported() {
        let policy = CostingPolicy::default();
        let (balance, entry) = commit(&Balance::empty(key(), Utc::now()), dec!(4), dec!(10), &policy, 1);
        let mut tampered = balance.clone();
        tampered.qty = dec!(5);

        let replayed = replay_balance(key(), [&entry], &policy, Utc::now()).unwrap();
        let rec = BalanceReconciliation::new(key(), Some(&tampered), &replayed);

        assert!(!rec.is_consistent());
        assert_eq!(rec.qty_drift(), dec!(1));
        assert_eq!(rec.avg_cost_drift(), Decimal::ZERO);
    }
}
