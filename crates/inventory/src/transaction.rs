//! Immutable transaction headers and lines.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{Entity, ProductId, TransactionId, UserId, WarehouseId};

use crate::movement::{MovementCode, MovementType, TransferSide};

/// Link back to the document that caused a movement (e.g. a goods receipt).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub module: Option<String>,
    pub id: Option<Uuid>,
}

/// Transaction header. Terminal the instant it commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub code: MovementCode,
    pub tx_type: MovementType,
    pub warehouse_id: WarehouseId,
    pub reference: Reference,
    pub note: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub created_by: Option<UserId>,
}

impl Entity for Transaction {
    type Id = TransactionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// One product line of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLine {
    pub transaction_id: TransactionId,
    /// Position within the transaction, starting at 1.
    pub line_no: u32,
    pub product_id: ProductId,
    /// Signed quantity (negative = stock leaves the warehouse).
    pub qty: Decimal,
    pub unit_cost: Decimal,
    /// Set on transfer legs only.
    pub side: Option<TransferSide>,
}
