use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{IdempotencyError, IdempotencyStore};

/// Mutex-guarded reservation map (key -> scope) for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    keys: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.lock().map(|k| k.contains_key(key)).unwrap_or(false)
    }

    /// Scope a key was reserved under.
    pub fn scope_of(&self, key: &str) -> Option<String> {
        self.keys
            .lock()
            .ok()
            .and_then(|k| k.get(key).cloned())
    }

    pub fn len(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_insert(&self, key: &str, scope: &str) -> Result<(), IdempotencyError> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| IdempotencyError::Backend("lock poisoned".to_string()))?;

        if keys.contains_key(key) {
            return Err(IdempotencyError::Duplicate(key.to_string()));
        }
        keys.insert(key.to_string(), scope.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), IdempotencyError> {
        self.keys
            .lock()
            .map_err(|_| IdempotencyError::Backend("lock poisoned".to_string()))?
            .remove(key);
        Ok(())
    }
}
