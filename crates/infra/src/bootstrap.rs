//! Process wiring: logging and ledger services built from a [`LedgerConfig`].

use thiserror::Error;
#[cfg(feature = "postgres")]
use tracing::info;

use crate::config::{ConfigError, LedgerConfig};
use crate::idempotency::InMemoryIdempotencyStore;
#[cfg(feature = "postgres")]
use crate::idempotency::PostgresIdempotencyStore;
use crate::service::InventoryLedgerService;
#[cfg(feature = "postgres")]
use crate::store::PostgresInventoryStore;
use crate::store::{InMemoryInventoryStore, StoreError};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type InMemoryLedger = InventoryLedgerService<InMemoryInventoryStore, InMemoryIdempotencyStore>;

#[cfg(feature = "postgres")]
pub type PostgresLedger = InventoryLedgerService<PostgresInventoryStore, PostgresIdempotencyStore>;

/// Install the process-wide subscriber in the configured format.
pub fn init_logging(config: &LedgerConfig) {
    stockledger_observability::init_with(config.log_format);
}

/// Single-process ledger with in-memory stores.
pub fn in_memory_ledger(config: &LedgerConfig) -> InMemoryLedger {
    InventoryLedgerService::new(
        InMemoryInventoryStore::from_config(config),
        InMemoryIdempotencyStore::new(),
        config,
    )
}

/// Ledger over Postgres; both stores share one pool sized by
/// `db_max_connections`. The schema is not applied here, see
/// [`PostgresInventoryStore::apply_schema`].
#[cfg(feature = "postgres")]
pub async fn postgres_ledger(config: &LedgerConfig) -> Result<PostgresLedger, BootstrapError> {
    let url = config.require_database_url()?;
    let store = PostgresInventoryStore::connect(url, config.db_max_connections).await?;
    let idempotency = PostgresIdempotencyStore::new(store.pool().clone());

    info!(max_connections = config.db_max_connections, "ledger stores connected to postgres");
    Ok(InventoryLedgerService::new(store, idempotency, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockledger_core::{ProductId, WarehouseId};
    use stockledger_inventory::InboundInput;
    use stockledger_observability::LogFormat;

    #[tokio::test]
    async fn in_memory_ledger_follows_config() {
        let config = LedgerConfig {
            allow_negative_stock: true,
            log_format: LogFormat::Pretty,
            ..LedgerConfig::default()
        };
        init_logging(&config);
        let ledger = in_memory_ledger(&config);
        assert!(ledger.policy().allow_negative_stock);

        let entry = ledger
            .post_inbound(InboundInput {
                warehouse_id: WarehouseId::new(1),
                product_id: ProductId::new(1),
                qty: dec!(2),
                unit_cost: dec!(3),
                code: Some("GRN-1".to_string()),
                ref_module: None,
                ref_id: None,
                note: None,
                created_by: None,
                posted_at: None,
            })
            .await
            .unwrap();
        assert_eq!(entry.balance_qty, dec!(2));
    }

    #[cfg(feature = "postgres")]
    #[tokio::test]
    async fn postgres_ledger_needs_database_url() {
        let err = postgres_ledger(&LedgerConfig::default()).await.err().unwrap();
        assert!(matches!(err, BootstrapError::Config(ConfigError::Missing(_))), "{err:?}");
    }
}
