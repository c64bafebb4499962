//! Downstream notification of posted adjustments (e.g. to the general ledger).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use stockledger_events::EventEnvelope;
use stockledger_inventory::InventoryAdjustmentPosted;

/// Receives committed ADJUST movements.
///
/// Called synchronously after commit; an error is reported to the poster but
/// does not undo the movement.
#[async_trait]
pub trait IntegrationHandler: Send + Sync {
    async fn handle_inventory_adjustment_posted(
        &self,
        event: &EventEnvelope<InventoryAdjustmentPosted>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<H> IntegrationHandler for Arc<H>
where
    H: IntegrationHandler + ?Sized,
{
    async fn handle_inventory_adjustment_posted(
        &self,
        event: &EventEnvelope<InventoryAdjustmentPosted>,
    ) -> anyhow::Result<()> {
        (**self).handle_inventory_adjustment_posted(event).await
    }
}

/// Accepts and drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopIntegrationHandler;

#[async_trait]
impl IntegrationHandler for NoopIntegrationHandler {
    async fn handle_inventory_adjustment_posted(
        &self,
        _event: &EventEnvelope<InventoryAdjustmentPosted>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory handler for tests/dev: records every event it receives.
#[derive(Debug, Default)]
pub struct RecordingIntegrationHandler {
    inner: Mutex<Vec<EventEnvelope<InventoryAdjustmentPosted>>>,
}

impl RecordingIntegrationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<EventEnvelope<InventoryAdjustmentPosted>> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl IntegrationHandler for RecordingIntegrationHandler {
    async fn handle_inventory_adjustment_posted(
        &self,
        event: &EventEnvelope<InventoryAdjustmentPosted>,
    ) -> anyhow::Result<()> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("integration handler lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}
