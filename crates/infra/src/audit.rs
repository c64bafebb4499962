use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use stockledger_core::UserId;
use stockledger_inventory::{StockCardEntry, Transaction};

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    /// e.g. `inventory.adjust`
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl AuditLog {
    /// Record for one committed movement.
    pub fn for_movement(header: &Transaction, entry: &StockCardEntry) -> Self {
        Self {
            id: Uuid::now_v7(),
            action: format!("inventory.{}", header.tx_type.as_str().to_ascii_lowercase()),
            entity_type: "inventory_transaction".to_string(),
            entity_id: header.id.to_string(),
            actor: header.created_by,
            occurred_at: Utc::now(),
            details: json!({
                "code": header.code.as_str(),
                "warehouse_id": entry.warehouse_id.get(),
                "product_id": entry.product_id.get(),
                "qty_in": entry.qty_in,
                "qty_out": entry.qty_out,
                "unit_cost": entry.unit_cost,
                "balance_qty": entry.balance_qty,
                "balance_cost": entry.balance_cost,
                "ref_module": header.reference.module,
                "ref_id": header.reference.id,
                "posted_at": header.posted_at,
            }),
        }
    }
}

/// Best-effort audit sink.
///
/// Failures are logged by the caller and never fail the posting.
#[async_trait]
pub trait AuditPort: Send + Sync {
    async fn record(&self, log: AuditLog) -> anyhow::Result<()>;
}

#[async_trait]
impl<A> AuditPort for Arc<A>
where
    A: AuditPort + ?Sized,
{
    async fn record(&self, log: AuditLog) -> anyhow::Result<()> {
        (**self).record(log).await
    }
}

/// Emits each record as a structured `tracing` event on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditPort for TracingAuditSink {
    async fn record(&self, log: AuditLog) -> anyhow::Result<()> {
        tracing::info!(
            target: "audit",
            audit_id = %log.id,
            action = %log.action,
            entity_type = %log.entity_type,
            entity_id = %log.entity_id,
            actor = ?log.actor,
            details = %log.details,
            "audit record"
        );
        Ok(())
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    inner: Mutex<Vec<AuditLog>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<AuditLog> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditPort for InMemoryAuditSink {
    async fn record(&self, log: AuditLog) -> anyhow::Result<()> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("audit sink lock poisoned"))?
            .push(log);
        Ok(())
    }
}
