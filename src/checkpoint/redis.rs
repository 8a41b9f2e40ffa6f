//! Redis-backed checkpoint store.
//!
//! Values are stored as JSON strings under `<prefix>:<key>`. A stored string
//! that is not valid JSON is returned as a JSON string.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use super::store::{namespaced_key, CheckpointStore, DEFAULT_CHECKPOINT_PREFIX};
use crate::error::CheckpointError;

/// Options of the `kued/providers/redis-checkpointer` provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisCheckpointOptions {
    pub url: String,
    pub prefix: String,
    /// Database index selected after connecting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db: Option<i64>,
}

impl Default for RedisCheckpointOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: DEFAULT_CHECKPOINT_PREFIX.to_string(),
            db: None,
        }
    }
}

/// Checkpoint store over a Redis string key per checkpoint.
pub struct RedisCheckpointStore {
    prefix: String,
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisCheckpointStore {
    /// Creates the store; the connection opens on first use.
    pub fn new(options: RedisCheckpointOptions) -> Result<Self, CheckpointError> {
        let mut info = options
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| CheckpointError::ConnectionFailed(e.to_string()))?;
        if let Some(db) = options.db {
            info.redis.db = db;
        }

        let client = redis::Client::open(info)
            .map_err(|e| CheckpointError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            prefix: options.prefix,
            client,
            connection: OnceCell::new(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self, namespace: &str) -> String {
        namespaced_key(&self.prefix, namespace)
    }

    async fn connection(&self) -> Result<ConnectionManager, CheckpointError> {
        self.connection
            .get_or_try_init(|| async {
                let conn = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| {
                        error!(error = %e, "Error connecting to Redis");
                        CheckpointError::ConnectionFailed(e.to_string())
                    })?;
                info!(prefix = %self.prefix, "Checkpoint store connected to Redis");
                Ok(conn)
            })
            .await
            .cloned()
    }
}

/// Parse a stored value, falling back to the raw string.
pub(crate) fn parse_stored(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get_checkpoint(&self, namespace: &str) -> Result<Option<Value>, CheckpointError> {
        let key = self.key(namespace);
        let mut conn = self.connection().await?;

        let raw: Option<String> = conn.get(&key).await.map_err(|e| {
            error!(key = %key, error = %e, "Could not retrieve checkpoint from Redis");
            CheckpointError::Redis(e)
        })?;

        Ok(raw.map(parse_stored))
    }

    async fn update_checkpoint(
        &self,
        namespace: &str,
        value: &Value,
    ) -> Result<(), CheckpointError> {
        let key = self.key(namespace);
        let json_value = serde_json::to_string(value)?;
        let mut conn = self.connection().await?;

        conn.set::<_, _, ()>(&key, json_value).await.map_err(|e| {
            error!(key = %key, error = %e, "Could not set checkpoint in Redis");
            CheckpointError::Redis(e)
        })?;

        debug!(key = %key, "Checkpoint written");
        Ok(())
    }
}
