//! Redis-backed plugin storage (optional).
//!
//! Values are stored as JSON strings under `{namespace}:{key}`. Each call
//! opens a connection from the client; fine for plugin cursors and small
//! state, not for hot paths.

use redis::Commands;
use serde_json::Value;

use drowl_plugins::{KeyValueStore, StorageError};

#[derive(Debug, Clone)]
pub struct RedisKeyValueStore {
    client: redis::Client,
    namespace: String,
}

impl RedisKeyValueStore {
    pub fn new(redis_url: impl AsRef<str>, namespace: impl Into<String>) -> Result<Self, StorageError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn connection(&self) -> Result<redis::Connection, StorageError> {
        self.client
            .get_connection()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

impl KeyValueStore for RedisKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let raw: Option<String> = self
            .connection()?
            .get(self.key(key))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        raw.map(|s| serde_json::from_str(&s).map_err(|e| StorageError::Serialization(e.to_string())))
            .transpose()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let payload =
            serde_json::to_string(&value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let _: () = self
            .connection()?
            .set(self.key(key), payload)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let removed: i64 = self
            .connection()?
            .del(self.key(key))
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }
}
