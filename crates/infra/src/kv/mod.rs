//! Backends for plugin key-value storage.

#[cfg(feature = "redis")]
pub mod redis_kv;

use std::sync::Arc;

use drowl_plugins::{InMemoryKeyValueStore, KeyValueStore, StorageError};

use crate::config::EngineConfig;

/// Pick the plugin storage backend for `config`.
///
/// Redis is used when `redis_url` is set and the `redis` feature is enabled;
/// otherwise storage lives in memory.
pub fn build_kv_store(config: &EngineConfig) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = redis_kv::RedisKeyValueStore::new(url, "drowl")?;
            tracing::info!("plugin storage backed by redis");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("DROWL_REDIS_URL set but the redis feature is disabled; using in-memory plugin storage");
            Ok(Arc::new(InMemoryKeyValueStore::new()))
        }
        None => Ok(Arc::new(InMemoryKeyValueStore::new())),
    }
}
