//! Transactional ledger store boundary.
//!
//! Defines the storage contract the posting service runs against, with an
//! in-memory implementation (tests/dev, single process) and a Postgres one.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryInventoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresInventoryStore;
pub use r#trait::{InventoryStore, StoreError, StoreTx};
