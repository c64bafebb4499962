//! Typed movement inputs and their validation.
//!
//! Presentation adapters translate form fields into these structs; the ledger
//! validates them before touching any collaborator.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{DomainError, DomainResult, ProductId, UserId, ValueObject, WarehouseId};

use crate::balance::{BalanceKey, CostingPolicy};
use crate::movement::{MovementCode, MovementType, TransferSide};
use crate::transaction::Reference;

const MAX_REF_MODULE_LEN: usize = 64;

/// Goods received into a warehouse at a known unit cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundInput {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub qty: Decimal,
    pub unit_cost: Decimal,
    pub code: Option<String>,
    pub ref_module: Option<String>,
    pub ref_id: Option<String>,
    pub note: Option<String>,
    pub created_by: Option<UserId>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Manual correction; `qty` is signed. `unit_cost` values a positive adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentInput {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub qty: Decimal,
    pub unit_cost: Decimal,
    pub code: Option<String>,
    pub ref_module: Option<String>,
    pub ref_id: Option<String>,
    pub note: Option<String>,
    pub created_by: Option<UserId>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Move stock between two warehouses at the source's average cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInput {
    pub from_warehouse_id: WarehouseId,
    pub to_warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub qty: Decimal,
    pub code: Option<String>,
    pub ref_module: Option<String>,
    pub ref_id: Option<String>,
    pub note: Option<String>,
    pub created_by: Option<UserId>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Fields shared by every movement after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementContext {
    /// `None` when the caller did not supply a code.
    pub code: Option<MovementCode>,
    pub reference: Reference,
    pub note: Option<String>,
    pub created_by: Option<UserId>,
    pub posted_at: Option<DateTime<Utc>>,
}

/// A validated single-key movement, ready for the costing engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementRequest {
    pub movement_type: MovementType,
    pub key: BalanceKey,
    /// Signed quantity delta.
    pub delta: Decimal,
    /// Valuation of an inbound-direction delta; ignored when `delta < 0`.
    pub unit_cost: Decimal,
    pub side: Option<TransferSide>,
    pub context: MovementContext,
}

impl ValueObject for MovementRequest {}

/// A validated transfer, split into legs by the service once its code is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source: BalanceKey,
    pub destination: BalanceKey,
    pub qty: Decimal,
    pub context: MovementContext,
}

impl TransferRequest {
    /// Outbound leg at the source. Its unit cost is decided by the source balance.
    pub fn out_leg(&self, code: MovementCode) -> MovementRequest {
        MovementRequest {
            movement_type: MovementType::Transfer,
            key: self.source,
            delta: -self.qty,
            unit_cost: Decimal::ZERO,
            side: Some(TransferSide::Source),
            context: MovementContext {
                code: Some(code.leg(TransferSide::Source)),
                ..self.context.clone()
            },
        }
    }

    /// Inbound leg at the destination, valued at the source leg's unit cost.
    pub fn in_leg(&self, code: MovementCode, unit_cost: Decimal) -> MovementRequest {
        MovementRequest {
            movement_type: MovementType::Transfer,
            key: self.destination,
            delta: self.qty,
            unit_cost,
            side: Some(TransferSide::Destination),
            context: MovementContext {
                code: Some(code.leg(TransferSide::Destination)),
                ..self.context.clone()
            },
        }
    }
}

impl InboundInput {
    pub fn validate(&self, policy: &CostingPolicy) -> DomainResult<MovementRequest> {
        let key = validate_key(self.warehouse_id, self.product_id)?;
        let qty = validate_qty(self.qty, policy)?;
        if qty <= Decimal::ZERO {
            return Err(DomainError::validation("inbound quantity must be positive"));
        }
        let unit_cost = validate_unit_cost(self.unit_cost, policy)?;

        Ok(MovementRequest {
            movement_type: MovementType::In,
            key,
            delta: qty,
            unit_cost,
            side: None,
            context: validate_context(
                self.code.as_deref(),
                self.ref_module.as_deref(),
                self.ref_id.as_deref(),
                self.note.as_deref(),
                self.created_by,
                self.posted_at,
            )?,
        })
    }
}

impl AdjustmentInput {
    pub fn validate(&self, policy: &CostingPolicy) -> DomainResult<MovementRequest> {
        let key = validate_key(self.warehouse_id, self.product_id)?;
        let qty = validate_qty(self.qty, policy)?;
        let unit_cost = if qty > Decimal::ZERO {
            validate_unit_cost(self.unit_cost, policy)?
        } else {
            Decimal::ZERO
        };

        Ok(MovementRequest {
            movement_type: MovementType::Adjust,
            key,
            delta: qty,
            unit_cost,
            side: None,
            context: validate_context(
                self.code.as_deref(),
                self.ref_module.as_deref(),
                self.ref_id.as_deref(),
                self.note.as_deref(),
                self.created_by,
                self.posted_at,
            )?,
        })
    }
}

impl TransferInput {
    pub fn validate(&self, policy: &CostingPolicy) -> DomainResult<TransferRequest> {
        let source = validate_key(self.from_warehouse_id, self.product_id)?;
        let destination = validate_key(self.to_warehouse_id, self.product_id)?;
        if source.warehouse_id == destination.warehouse_id {
            return Err(DomainError::validation(
                "source and destination warehouses must differ",
            ));
        }
        let qty = validate_qty(self.qty, policy)?;
        if qty <= Decimal::ZERO {
            return Err(DomainError::validation("transfer quantity must be positive"));
        }

        Ok(TransferRequest {
            source,
            destination,
            qty,
            context: validate_context(
                self.code.as_deref(),
                self.ref_module.as_deref(),
                self.ref_id.as_deref(),
                self.note.as_deref(),
                self.created_by,
                self.posted_at,
            )?,
        })
    }
}

fn validate_key(warehouse_id: WarehouseId, product_id: ProductId) -> DomainResult<BalanceKey> {
    Ok(BalanceKey::new(
        warehouse_id.ensure_valid()?,
        product_id.ensure_valid()?,
    ))
}

fn validate_qty(qty: Decimal, policy: &CostingPolicy) -> DomainResult<Decimal> {
    if policy.is_zero_qty(qty) {
        return Err(DomainError::validation("quantity cannot be zero"));
    }
    let qty = qty.normalize();
    if qty.scale() > policy.qty_scale {
        return Err(DomainError::validation(format!(
            "quantity {qty} has more than {} decimal places",
            policy.qty_scale
        )));
    }
    Ok(qty)
}

fn validate_unit_cost(cost: Decimal, policy: &CostingPolicy) -> DomainResult<Decimal> {
    if cost < Decimal::ZERO {
        return Err(DomainError::validation("unit cost cannot be negative"));
    }
    let cost = cost.normalize();
    if cost.scale() > policy.cost_scale {
        return Err(DomainError::validation(format!(
            "unit cost {cost} has more than {} decimal places",
            policy.cost_scale
        )));
    }
    Ok(cost)
}

fn validate_context(
    code: Option<&str>,
    ref_module: Option<&str>,
    ref_id: Option<&str>,
    note: Option<&str>,
    created_by: Option<UserId>,
    posted_at: Option<DateTime<Utc>>,
) -> DomainResult<MovementContext> {
    let code = code.map(MovementCode::parse).transpose()?;

    let module = match ref_module.map(str::trim) {
        None => None,
        Some("") => return Err(DomainError::validation("reference module cannot be blank")),
        Some(m) if m.len() > MAX_REF_MODULE_LEN => {
            return Err(DomainError::validation(format!(
                "reference module longer than {MAX_REF_MODULE_LEN} characters"
            )));
        }
        Some(m) => Some(m.to_string()),
    };

    let id = ref_id
        .map(|raw| {
            Uuid::parse_str(raw.trim())
                .map_err(|e| DomainError::invalid_id(format!("reference id: {e}")))
        })
        .transpose()?;

    let note = note
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    Ok(MovementContext {
        code,
        reference: Reference { module, id },
        note,
        created_by,
        posted_at,
    })
}
