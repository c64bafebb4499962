//! Posting pipeline for the perpetual-inventory ledger.
//!
//! ## Movement flow
//!
//! ```text
//! Input
//!   ↓
//! 1. Validate (no side effects)
//!   ↓
//! 2. Resolve movement code (caller code, or a generated one)
//!   ↓
//! 3. Reserve idempotency key (type, code, warehouse, product)
//!   ↓
//! 4. Store transaction: lock balance → cost → header, line, balance, card → commit
//!   ↓                  (any failure or cancellation: roll back, release the reservation)
//! 5. Audit (best-effort)
//!   ↓
//! 6. ADJUST only: integration handler (failure reported after commit)
//! ```
//!
//! Postings on the same `(warehouse, product)` serialise on the balance lock;
//! postings on different keys run in parallel.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use stockledger_core::{DomainError, ProductId, TransactionId, WarehouseId};
use stockledger_events::EventEnvelope;
use stockledger_inventory::{
    AdjustmentInput, Balance, BalanceKey, BalanceReconciliation, CardEntryDraft, CostingError,
    CostingPolicy, IDEMPOTENCY_SCOPE, IdempotencyKey, InboundInput, InventoryAdjustmentPosted,
    MovementCode, MovementContext, MovementRequest, MovementType, NegativeStockError,
    StockCardEntry, StockCardFilter, Transaction, TransactionLine, TransferInput, TransferRequest,
    TransferSide, replay_balance,
};

use crate::audit::{AuditLog, AuditPort, TracingAuditSink};
use crate::config::LedgerConfig;
use crate::idempotency::{IdempotencyError, IdempotencyStore};
use crate::integration::{IntegrationHandler, NoopIntegrationHandler};
use crate::store::{InventoryStore, StoreError, StoreTx};

/// Error returned by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Rejected input; nothing was written.
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// The movement would take stock below zero; rolled back.
    #[error(transparent)]
    NegativeStock(#[from] NegativeStockError),

    /// The same logical movement is already in flight or committed.
    #[error("duplicate movement: {0}")]
    Duplicate(IdempotencyKey),

    #[error(transparent)]
    Idempotency(IdempotencyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("decimal overflow computing {0}")]
    Overflow(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    /// The adjustment committed but the integration handler failed.
    ///
    /// `entry` is durable; pass it to
    /// [`InventoryLedgerService::notify_adjustment`] to retry the notification.
    #[error("adjustment committed but integration failed: {source}")]
    Integration {
        entry: Box<StockCardEntry>,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The OUT leg of a transfer committed but the IN leg did not.
    ///
    /// Pass `out_entry` to [`InventoryLedgerService::complete_transfer`] to
    /// post the destination leg.
    #[error("transfer source leg committed but the destination leg failed: {source}")]
    TransferIncomplete {
        out_entry: Box<StockCardEntry>,
        source: Box<LedgerError>,
    },
}

impl LedgerError {
    /// Stable machine-readable kind, for presentation adapters.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation",
            LedgerError::NegativeStock(_) => "negative_stock",
            LedgerError::Duplicate(_) => "duplicate",
            LedgerError::Idempotency(_) => "idempotency",
            LedgerError::Store(StoreError::Conflict(_)) => "conflict",
            LedgerError::Store(StoreError::LockTimeout(_)) => "lock_timeout",
            LedgerError::Store(_) => "storage",
            LedgerError::Overflow(_) => "overflow",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::Integration { .. } => "integration",
            LedgerError::TransferIncomplete { .. } => "transfer_incomplete",
        }
    }

    /// Whether the movement this error came from is durable.
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            LedgerError::Integration { .. } | LedgerError::TransferIncomplete { .. }
        )
    }
}

impl From<CostingError> for LedgerError {
    fn from(value: CostingError) -> Self {
        match value {
            CostingError::NegativeStock(err) => LedgerError::NegativeStock(err),
            CostingError::Overflow(what) => LedgerError::Overflow(what),
        }
    }
}

/// Header and card entry of one committed movement.
struct PostedMovement {
    header: Transaction,
    entry: StockCardEntry,
}

/// Idempotency key reserved for a movement being written.
///
/// Dropping an armed reservation (the posting future was cancelled) releases
/// the key on the runtime in the background.
struct Reservation<I: IdempotencyStore + 'static> {
    store: Arc<I>,
    key: IdempotencyKey,
    armed: bool,
}

impl<I: IdempotencyStore + 'static> Reservation<I> {
    /// The movement committed: the key stays reserved for good.
    fn keep(mut self) {
        self.armed = false;
    }

    async fn release(mut self) {
        let result = self.store.delete(self.key.as_str()).await;
        self.armed = false;
        if let Err(err) = result {
            warn!(idempotency_key = %self.key, error = %err, "failed to release idempotency key");
        }
    }
}

impl<I: IdempotencyStore + 'static> Drop for Reservation<I> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.delete(key.as_str()).await {
                        Ok(()) => debug!(idempotency_key = %key, "released key of cancelled movement"),
                        Err(err) => {
                            warn!(idempotency_key = %key, error = %err, "failed to release idempotency key")
                        }
                    }
                });
            }
            Err(_) => warn!(idempotency_key = %key, "no runtime to release key of cancelled movement"),
        }
    }
}

/// Perpetual-inventory ledger.
///
/// ## Generic Parameters
///
/// - `S`: transactional store ([`InventoryStore`])
/// - `I`: idempotency reservations ([`IdempotencyStore`])
///
/// Audit and integration collaborators are trait objects with defaults
/// ([`TracingAuditSink`], [`NoopIntegrationHandler`]).
pub struct InventoryLedgerService<S, I> {
    store: S,
    idempotency: Arc<I>,
    audit: Arc<dyn AuditPort>,
    integration: Arc<dyn IntegrationHandler>,
    policy: CostingPolicy,
    stock_card_default_limit: u32,
    stock_card_max_limit: u32,
    tx_retry_limit: u32,
}

impl<S, I> InventoryLedgerService<S, I>
where
    S: InventoryStore,
    I: IdempotencyStore + 'static,
{
    pub fn new(store: S, idempotency: I, config: &LedgerConfig) -> Self {
        Self {
            store,
            idempotency: Arc::new(idempotency),
            audit: Arc::new(TracingAuditSink),
            integration: Arc::new(NoopIntegrationHandler),
            policy: config.costing_policy(),
            stock_card_default_limit: config.stock_card_default_limit,
            stock_card_max_limit: config.stock_card_max_limit,
            tx_retry_limit: config.tx_retry_limit,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditPort>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_integration(mut self, integration: Arc<dyn IntegrationHandler>) -> Self {
        self.integration = integration;
        self
    }

    pub fn policy(&self) -> &CostingPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Receive goods into a warehouse.
    #[instrument(
        skip(self, input),
        fields(
            warehouse_id = %input.warehouse_id,
            product_id = %input.product_id,
            code = ?input.code
        ),
        err
    )]
    pub async fn post_inbound(&self, input: InboundInput) -> Result<StockCardEntry, LedgerError> {
        let request = input.validate(&self.policy)?;
        let posted = self.post_movement(request).await?;
        Ok(posted.entry)
    }

    /// Post a signed manual correction and notify the integration handler.
    #[instrument(
        skip(self, input),
        fields(
            warehouse_id = %input.warehouse_id,
            product_id = %input.product_id,
            code = ?input.code
        ),
        err
    )]
    pub async fn post_adjustment(&self, input: AdjustmentInput) -> Result<StockCardEntry, LedgerError> {
        let request = input.validate(&self.policy)?;
        let posted = self.post_movement(request).await?;
        self.notify(&posted.header, &posted.entry).await?;
        Ok(posted.entry)
    }

    /// Move stock between warehouses as two movements: source OUT leg, then
    /// destination IN leg valued at the OUT leg's unit cost.
    ///
    /// Returns `(out_entry, in_entry)`.
    #[instrument(
        skip(self, input),
        fields(
            from_warehouse_id = %input.from_warehouse_id,
            to_warehouse_id = %input.to_warehouse_id,
            product_id = %input.product_id,
            code = ?input.code
        ),
        err
    )]
    pub async fn post_transfer(
        &self,
        input: TransferInput,
    ) -> Result<(StockCardEntry, StockCardEntry), LedgerError> {
        let request = input.validate(&self.policy)?;
        let code = match &request.context.code {
            Some(code) => code.clone(),
            None => generated_code(MovementType::Transfer),
        };

        let out = self.post_movement(request.out_leg(code.clone())).await?;

        let in_leg = request.in_leg(code, out.entry.unit_cost);
        match self.post_movement(in_leg).await {
            Ok(inbound) => Ok((out.entry, inbound.entry)),
            Err(err) => {
                error!(
                    out_code = %out.entry.tx_code,
                    out_transaction_id = %out.entry.transaction_id,
                    error = %err,
                    "transfer destination leg failed after source leg committed"
                );
                Err(LedgerError::TransferIncomplete {
                    out_entry: Box::new(out.entry),
                    source: Box::new(err),
                })
            }
        }
    }

    /// Post the destination leg of a transfer whose source leg committed alone
    /// (see [`LedgerError::TransferIncomplete`]).
    ///
    /// The leg is posted under `<code>-IN` at the source leg's unit cost, with
    /// the source header's reference, note, author and posting time. Completing
    /// the same transfer twice is a [`LedgerError::Duplicate`].
    #[instrument(
        skip(self, out_entry),
        fields(code = %out_entry.tx_code, to_warehouse_id = %to_warehouse_id),
        err
    )]
    pub async fn complete_transfer(
        &self,
        out_entry: &StockCardEntry,
        to_warehouse_id: WarehouseId,
    ) -> Result<StockCardEntry, LedgerError> {
        let to_warehouse_id = to_warehouse_id.ensure_valid()?;
        let not_source_leg = || {
            DomainError::validation(format!(
                "{} is not the source leg of a transfer",
                out_entry.tx_code
            ))
        };

        let code = out_entry
            .tx_code
            .transfer_code(TransferSide::Source)
            .filter(|_| out_entry.tx_type == MovementType::Transfer)
            .ok_or_else(not_source_leg)?;
        if to_warehouse_id == out_entry.warehouse_id {
            return Err(DomainError::validation("source and destination warehouses must differ").into());
        }

        let (header, lines) = self
            .store
            .transaction(out_entry.transaction_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", out_entry.transaction_id)))?;
        if !lines.iter().any(|line| line.side == Some(TransferSide::Source)) {
            return Err(not_source_leg().into());
        }

        let request = TransferRequest {
            source: out_entry.key(),
            destination: BalanceKey::new(to_warehouse_id, out_entry.product_id),
            qty: out_entry.qty_out,
            context: MovementContext {
                code: Some(code.clone()),
                reference: header.reference,
                note: header.note,
                created_by: header.created_by,
                posted_at: Some(header.posted_at),
            },
        };
        let posted = self
            .post_movement(request.in_leg(code, out_entry.unit_cost))
            .await?;
        Ok(posted.entry)
    }

    /// Stock card page for one key: `posted_at` ascending, ties in insertion order.
    #[instrument(
        skip(self, filter),
        fields(warehouse_id = %filter.warehouse_id, product_id = %filter.product_id),
        err
    )]
    pub async fn get_stock_card(
        &self,
        filter: StockCardFilter,
    ) -> Result<Vec<StockCardEntry>, LedgerError> {
        filter.validate()?;
        let limit = filter.effective_limit(self.stock_card_default_limit, self.stock_card_max_limit);
        Ok(self.store.stock_card(&filter, limit).await?)
    }

    /// Current balance, without locking. `None` if the key never moved.
    pub async fn get_balance(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<Balance>, LedgerError> {
        let key = BalanceKey::new(warehouse_id.ensure_valid()?, product_id.ensure_valid()?);
        Ok(self.store.balance(key).await?)
    }

    /// Replay the full card of a key and compare it with the stored balance.
    #[instrument(skip(self), err)]
    pub async fn reconcile_balance(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<BalanceReconciliation, LedgerError> {
        let key = BalanceKey::new(warehouse_id.ensure_valid()?, product_id.ensure_valid()?);

        let entries = self.store.load_card(key).await?;
        let stored = self.store.balance(key).await?;
        let replayed = replay_balance(key, &entries, &self.policy, Utc::now())?;

        let report = BalanceReconciliation::new(key, stored.as_ref(), &replayed);
        if report.is_consistent() {
            debug!(%key, movements = report.movements, "balance consistent with stock card");
        } else {
            warn!(
                %key,
                qty_drift = %report.qty_drift(),
                avg_cost_drift = %report.avg_cost_drift(),
                "balance drifted from stock card"
            );
        }
        Ok(report)
    }

    /// Re-send the integration event of a committed adjustment.
    #[instrument(skip(self, entry), fields(code = %entry.tx_code), err)]
    pub async fn notify_adjustment(&self, entry: &StockCardEntry) -> Result<(), LedgerError> {
        if entry.tx_type != MovementType::Adjust {
            return Err(DomainError::validation(format!(
                "{} is a {} movement, not an adjustment",
                entry.tx_code, entry.tx_type
            ))
            .into());
        }
        let header = self.load_header(entry.transaction_id).await?;
        self.notify(&header, entry).await
    }

    async fn load_header(&self, id: TransactionId) -> Result<Transaction, LedgerError> {
        self.store
            .transaction(id)
            .await?
            .map(|(header, _)| header)
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {id}")))
    }

    /// Reserve, write, release-on-failure, audit.
    async fn post_movement(&self, request: MovementRequest) -> Result<PostedMovement, LedgerError> {
        let code = match &request.context.code {
            Some(code) => code.clone(),
            None => generated_code(request.movement_type),
        };
        let key = IdempotencyKey::for_movement(
            request.movement_type,
            &code,
            request.key.warehouse_id,
            request.key.product_id,
        );

        let reservation = self.reserve(key).await?;

        let posted = match self.write_with_retry(&request, &code).await {
            Ok(posted) => {
                reservation.keep();
                posted
            }
            Err(err) => {
                reservation.release().await;
                return Err(err);
            }
        };

        info!(
            code = %posted.entry.tx_code,
            tx_type = %posted.entry.tx_type,
            warehouse_id = %posted.entry.warehouse_id,
            product_id = %posted.entry.product_id,
            balance_qty = %posted.entry.balance_qty,
            balance_cost = %posted.entry.balance_cost,
            "movement posted"
        );

        self.audit(&posted.header, &posted.entry).await;
        Ok(posted)
    }

    async fn reserve(&self, key: IdempotencyKey) -> Result<Reservation<I>, LedgerError> {
        self.idempotency
            .check_and_insert(key.as_str(), IDEMPOTENCY_SCOPE)
            .await
            .map_err(|err| match err {
                IdempotencyError::Duplicate(_) => LedgerError::Duplicate(key.clone()),
                other => LedgerError::Idempotency(other),
            })?;

        Ok(Reservation {
            store: self.idempotency.clone(),
            key,
            armed: true,
        })
    }

    async fn write_with_retry(
        &self,
        request: &MovementRequest,
        code: &MovementCode,
    ) -> Result<PostedMovement, LedgerError> {
        let mut attempt = 0;
        loop {
            match self.write_movement(request, code).await {
                Err(LedgerError::Store(err)) if err.is_retryable() && attempt < self.tx_retry_limit => {
                    attempt += 1;
                    warn!(%code, attempt, error = %err, "retrying movement after serialization failure");
                }
                result => return result,
            }
        }
    }

    /// One store transaction; rolled back on any error before commit.
    async fn write_movement(
        &self,
        request: &MovementRequest,
        code: &MovementCode,
    ) -> Result<PostedMovement, LedgerError> {
        let mut tx = self.store.begin().await?;

        match self.apply_in_tx(tx.as_mut(), request, code).await {
            Ok(posted) => {
                tx.commit().await?;
                Ok(posted)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(%code, error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn apply_in_tx(
        &self,
        tx: &mut dyn StoreTx,
        request: &MovementRequest,
        code: &MovementCode,
    ) -> Result<PostedMovement, LedgerError> {
        let now = Utc::now();

        let current = tx
            .get_balance_for_update(request.key)
            .await?
            .unwrap_or_else(|| Balance::empty(request.key, now));
        let applied = current.apply(request.delta, request.unit_cost, &self.policy, now)?;

        let header = Transaction {
            id: TransactionId::new(),
            code: code.clone(),
            tx_type: request.movement_type,
            warehouse_id: request.key.warehouse_id,
            reference: request.context.reference.clone(),
            note: request.context.note.clone(),
            posted_at: request.context.posted_at.unwrap_or(now),
            created_by: request.context.created_by,
        };
        let line = TransactionLine {
            transaction_id: header.id,
            line_no: 1,
            product_id: request.key.product_id,
            qty: request.delta,
            unit_cost: applied.unit_cost,
            side: request.side,
        };

        tx.insert_transaction(&header).await?;
        tx.insert_transaction_lines(std::slice::from_ref(&line)).await?;
        tx.upsert_balance(&applied.balance).await?;
        let entry = tx
            .insert_card_entry(CardEntryDraft::for_movement(&header, &applied))
            .await?;

        Ok(PostedMovement { header, entry })
    }

    async fn audit(&self, header: &Transaction, entry: &StockCardEntry) {
        if let Err(err) = self.audit.record(AuditLog::for_movement(header, entry)).await {
            warn!(code = %header.code, error = %err, "audit record failed");
        }
    }

    async fn notify(&self, header: &Transaction, entry: &StockCardEntry) -> Result<(), LedgerError> {
        let event = EventEnvelope::wrap(InventoryAdjustmentPosted::from_entry(
            header,
            entry,
            &self.policy,
        ));

        self.integration
            .handle_inventory_adjustment_posted(&event)
            .await
            .map_err(|err| {
                error!(
                    code = %entry.tx_code,
                    event_id = %event.event_id(),
                    error = %err,
                    "integration handler failed for committed adjustment"
                );
                LedgerError::Integration {
                    entry: Box::new(entry.clone()),
                    source: err.into(),
                }
            })
    }
}

/// Timestamp code for callers that supplied none. Such movements cannot be
/// deduplicated.
fn generated_code(movement_type: MovementType) -> MovementCode {
    let code = MovementCode::generate(movement_type, Utc::now());
    warn!(%code, "no movement code supplied; generated one, idempotency is not enforced");
    code
}
