//! Infrastructure layer: ledger stores, collaborators, config and the posting service.

pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod idempotency;
pub mod integration;
pub mod service;
pub mod store;

pub use audit::{AuditLog, AuditPort, InMemoryAuditSink, TracingAuditSink};
pub use bootstrap::{BootstrapError, InMemoryLedger, in_memory_ledger, init_logging};
#[cfg(feature = "postgres")]
pub use bootstrap::{PostgresLedger, postgres_ledger};
pub use config::{ConfigError, LedgerConfig};
pub use idempotency::{IdempotencyError, IdempotencyStore, InMemoryIdempotencyStore};
pub use integration::{IntegrationHandler, NoopIntegrationHandler, RecordingIntegrationHandler};
pub use service::{InventoryLedgerService, LedgerError};
pub use store::{InMemoryInventoryStore, InventoryStore, StoreError, StoreTx};
#[cfg(feature = "postgres")]
pub use idempotency::PostgresIdempotencyStore;
#[cfg(feature = "postgres")]
pub use store::PostgresInventoryStore;
