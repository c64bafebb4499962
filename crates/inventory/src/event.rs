//! Integration event published after an adjustment commits.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{ProductId, TransactionId, UserId, WarehouseId};
use stockledger_events::Event;

use crate::balance::CostingPolicy;
use crate::card::StockCardEntry;
use crate::movement::MovementCode;
use crate::transaction::Transaction;

/// An ADJUST movement has been committed to the stock ledger.
///
/// Consumed by the general-ledger pipeline to book the inventory write-up or
/// write-down. `amount` is the absolute movement value in the functional
/// currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryAdjustmentPosted {
    pub transaction_id: TransactionId,
    pub code: MovementCode,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    /// Signed quantity delta.
    pub qty: Decimal,
    pub unit_cost: Decimal,
    pub amount: Decimal,
    pub ref_module: Option<String>,
    pub ref_id: Option<Uuid>,
    pub note: Option<String>,
    pub created_by: Option<UserId>,
    pub posted_at: DateTime<Utc>,
}

impl InventoryAdjustmentPosted {
    pub fn from_entry(header: &Transaction, entry: &StockCardEntry, policy: &CostingPolicy) -> Self {
        let qty = entry.delta();
        Self {
            transaction_id: header.id,
            code: header.code.clone(),
            warehouse_id: entry.warehouse_id,
            product_id: entry.product_id,
            qty,
            unit_cost: entry.unit_cost,
            amount: policy.round_cost(qty.abs() * entry.unit_cost),
            ref_module: header.reference.module.clone(),
            ref_id: header.reference.id,
            note: header.note.clone(),
            created_by: header.created_by,
            posted_at: entry.posted_at,
        }
    }

    pub fn is_write_down(&self) -> bool {
        self.qty < Decimal::ZERO
    }
}

impl Event for InventoryAdjustmentPosted {
    fn event_type(&self) -> &'static str {
        "inventory.adjustment.posted"
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.posted_at
    }
}
