//! `idempotency_keys` table; the primary key is the reservation.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{IdempotencyError, IdempotencyStore};

#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: Arc<PgPool>,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn check_and_insert(&self, key: &str, scope: &str) -> Result<(), IdempotencyError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, scope)
            VALUES ($1, $2)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(scope)
        .execute(&*self.pool)
        .await
        .map_err(|e| IdempotencyError::Backend(format!("check_and_insert: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::Duplicate(key.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IdempotencyError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1")
            .bind(key)
            .execute(&*self.pool)
            .await
            .map_err(|e| IdempotencyError::Backend(format!("delete: {e}")))?;
        Ok(())
    }
}
