//! Idempotency reservations for ledger postings.
//!
//! A reservation is taken before the movement's transaction opens and is
//! released again if the movement does not commit, so the caller can retry.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryIdempotencyStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresIdempotencyStore;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The key is already reserved (posting in flight or committed).
    #[error("idempotency key already reserved: {0}")]
    Duplicate(String),

    #[error("idempotency backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically reserve `key` within `scope`; fails with
    /// [`IdempotencyError::Duplicate`] if it is already present.
    async fn check_and_insert(&self, key: &str, scope: &str) -> Result<(), IdempotencyError>;

    /// Release a reservation. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), IdempotencyError>;
}

#[async_trait]
impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    async fn check_and_insert(&self, key: &str, scope: &str) -> Result<(), IdempotencyError> {
        (**self).check_and_insert(key, scope).await
    }

    async fn delete(&self, key: &str) -> Result<(), IdempotencyError> {
        (**self).delete(key).await
    }
}
