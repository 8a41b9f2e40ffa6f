//! Checkpoint store abstraction.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CheckpointError;

/// Default namespace prefix of checkpoint keys.
pub const DEFAULT_CHECKPOINT_PREFIX: &str = "checkpoint";

/// Key-value store of progress markers.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the value stored under `key`, `None` if never written.
    async fn get_checkpoint(&self, key: &str) -> Result<Option<Value>, CheckpointError>;

    /// Overwrite the value stored under `key`.
    async fn update_checkpoint(&self, key: &str, value: &Value) -> Result<(), CheckpointError>;
}

/// Build the namespaced storage key `<prefix>:<key>`.
pub fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

/// Checkpoint store held in process memory.
#[derive(Debug)]
pub struct MemoryCheckpointStore {
    prefix: String,
    values: Mutex<HashMap<String, Value>>,
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_CHECKPOINT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a value, as if a previous run had written it.
    pub fn with_value(self, key: &str, value: Value) -> Self {
        if let Ok(mut values) = self.values.lock() {
            values.insert(namespaced_key(&self.prefix, key), value);
        }
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Raw view of the storage, keyed by namespaced key.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<Value>, CheckpointError> {
        let key = namespaced_key(&self.prefix, key);
        let values = self
            .values
            .lock()
            .map_err(|e| CheckpointError::ConnectionFailed(e.to_string()))?;
        Ok(values.get(&key).cloned())
    }

    async fn update_checkpoint(&self, key: &str, value: &Value) -> Result<(), CheckpointError> {
        let key = namespaced_key(&self.prefix, key);
        let mut values = self
            .values
            .lock()
            .map_err(|e| CheckpointError::ConnectionFailed(e.to_string()))?;
        values.insert(key, value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();

        assert_eq!(store.get_checkpoint("orders").await.expect("get"), None);

        store
            .update_checkpoint("orders", &json!({ "offset": 42 }))
            .await
            .expect("update");

        assert_eq!(
            store.get_checkpoint("orders").await.expect("get"),
            Some(json!({ "offset": 42 }))
        );
        assert!(store.snapshot().contains_key("checkpoint:orders"));
    }

    #[tokio::test]
    async fn test_seeded_value_uses_prefix() {
        let store = MemoryCheckpointStore::with_prefix("cp").with_value("a", json!(7));

        assert_eq!(store.get_checkpoint("a").await.expect("get"), Some(json!(7)));
        assert!(store.snapshot().contains_key("cp:a"));
    }
}
