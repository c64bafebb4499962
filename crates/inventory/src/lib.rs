//! Inventory ledger domain module.
//!
//! Business rules for the perpetual-inventory ledger, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage): movement inputs and
//! their validation, the weighted-average costing rule, transaction and stock
//! card records, and replay of a card into a balance.

pub mod balance;
pub mod card;
pub mod event;
pub mod input;
pub mod movement;
pub mod replay;
pub mod transaction;

pub use balance::{
    AppliedMovement, Balance, BalanceKey, CostingError, CostingPolicy, NegativeStockError,
};
pub use card::{CardEntryDraft, StockCardEntry, StockCardFilter, sort_chronologically};
pub use event::InventoryAdjustmentPosted;
pub use input::{
    AdjustmentInput, InboundInput, MovementContext, MovementRequest, TransferInput,
    TransferRequest,
};
pub use movement::{IDEMPOTENCY_SCOPE, IdempotencyKey, MovementCode, MovementType, TransferSide};
pub use replay::{BalanceReconciliation, replay_balance};
pub use transaction::{Reference, Transaction, TransactionLine};
