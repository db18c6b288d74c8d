//! Resources handed to a plugin: config, logger, storage, and a job queue.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

use drowl_core::{Job, JobId, NewJob};

use crate::config::ResolvedConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("failed to (de)serialize stored value: {0}")]
    Serialization(String),
}

/// Key-value persistence shared by all plugins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Returns whether a value was removed.
    fn delete(&self, key: &str) -> Result<bool, StorageError>;
}

/// In-memory key-value store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: DashMap<String, Value>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// A plugin's view of the key-value store; keys never collide across plugins.
#[derive(Clone)]
pub struct PluginStorage {
    prefix: String,
    backend: Arc<dyn KeyValueStore>,
}

impl PluginStorage {
    pub fn new(plugin_id: &str, backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            prefix: format!("plugin:{plugin_id}:"),
            backend,
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        self.backend.get(&self.key(key))
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.backend.set(&self.key(key), value)
    }

    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.backend.delete(&self.key(key))
    }
}

impl core::fmt::Debug for PluginStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginStorage").field("prefix", &self.prefix).finish()
    }
}

/// Log sink tagged with the plugin id.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: Arc<str>,
}

impl PluginLogger {
    pub fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(plugin_id = %self.plugin_id, "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(plugin_id = %self.plugin_id, "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(plugin_id = %self.plugin_id, "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(plugin_id = %self.plugin_id, "{message}");
    }
}

#[derive(Debug, Error)]
#[error("failed to enqueue job: {0}")]
pub struct EnqueueError(pub String);

/// Anything that accepts new jobs (the dispatcher's queue in production).
pub trait JobEnqueuer: Send + Sync {
    fn enqueue(&self, job: NewJob) -> Result<JobId, EnqueueError>;
}

/// Job submission on behalf of one plugin.
///
/// While a plugin runs a job, its queue is scoped to that job: everything it
/// enqueues becomes a child of the running job and counts towards the chain
/// limit.
#[derive(Clone)]
pub struct PluginQueue {
    plugin_id: String,
    enqueuer: Arc<dyn JobEnqueuer>,
    parent: Option<Arc<Job>>,
}

impl PluginQueue {
    pub fn new(plugin_id: &str, enqueuer: Arc<dyn JobEnqueuer>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            enqueuer,
            parent: None,
        }
    }

    pub fn scoped_to(&self, job: &Job) -> Self {
        Self {
            plugin_id: self.plugin_id.clone(),
            enqueuer: self.enqueuer.clone(),
            parent: Some(Arc::new(job.clone())),
        }
    }

    /// The job this queue is scoped to, if any.
    pub fn parent(&self) -> Option<&Job> {
        self.parent.as_deref()
    }

    /// Jobs without a plugin pin are pinned to the submitting plugin.
    pub fn enqueue(&self, mut job: NewJob) -> Result<JobId, EnqueueError> {
        if let Some(parent) = &self.parent {
            job = job.child_of(parent);
        }
        if job.metadata.plugin_id.is_none() {
            job.metadata.plugin_id = Some(self.plugin_id.clone());
        }
        let id = self.enqueuer.enqueue(job)?;
        tracing::debug!(
            plugin_id = %self.plugin_id,
            job_id = %id,
            parent_job_id = ?self.parent.as_ref().map(|p| p.id),
            "plugin enqueued job"
        );
        Ok(id)
    }
}

impl core::fmt::Debug for PluginQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginQueue")
            .field("plugin_id", &self.plugin_id)
            .field("parent", &self.parent.as_ref().map(|p| p.id))
            .finish()
    }
}

/// Everything a plugin may touch. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PluginContext {
    plugin_id: String,
    config: ResolvedConfig,
    logger: PluginLogger,
    storage: PluginStorage,
    queue: PluginQueue,
}

impl PluginContext {
    pub fn new(
        plugin_id: &str,
        config: ResolvedConfig,
        storage: Arc<dyn KeyValueStore>,
        enqueuer: Arc<dyn JobEnqueuer>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            config,
            logger: PluginLogger::new(plugin_id),
            storage: PluginStorage::new(plugin_id, storage),
            queue: PluginQueue::new(plugin_id, enqueuer),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    pub fn storage(&self) -> &PluginStorage {
        &self.storage
    }

    pub fn queue(&self) -> &PluginQueue {
        &self.queue
    }

    /// The same context with its queue scoped to `job`.
    pub fn scoped_to(&self, job: &Job) -> Self {
        Self {
            queue: self.queue.scoped_to(job),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use drowl_core::JobType;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingEnqueuer {
        jobs: Mutex<Vec<NewJob>>,
    }

    impl JobEnqueuer for RecordingEnqueuer {
        fn enqueue(&self, job: NewJob) -> Result<JobId, EnqueueError> {
            self.jobs.lock().unwrap().push(job);
            Ok(JobId::new())
        }
    }

    #[test]
    fn storage_is_namespaced_per_plugin() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let github = PluginStorage::new("github", backend.clone());
        let qiita = PluginStorage::new("qiita", backend.clone());

        github.set("cursor", json!("abc")).unwrap();

        assert_eq!(github.get("cursor").unwrap(), Some(json!("abc")));
        assert_eq!(qiita.get("cursor").unwrap(), None);
        assert_eq!(backend.get("plugin:github:cursor").unwrap(), Some(json!("abc")));
        assert!(github.delete("cursor").unwrap());
        assert!(!github.delete("cursor").unwrap());
    }

    #[test]
    fn queue_pins_jobs_to_the_submitting_plugin() {
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let queue = PluginQueue::new("github", enqueuer.clone());

        queue.enqueue(NewJob::new(JobType::Cleanup, "prune")).unwrap();
        queue
            .enqueue(NewJob::new(JobType::Cleanup, "other").with_plugin("qiita"))
            .unwrap();

        let jobs = enqueuer.jobs.lock().unwrap();
        assert_eq!(jobs[0].metadata.plugin_id.as_deref(), Some("github"));
        assert_eq!(jobs[1].metadata.plugin_id.as_deref(), Some("qiita"));
    }

    #[test]
    fn scoped_queue_enqueues_children_of_the_running_job() {
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let ctx = PluginContext::new(
            "github",
            Default::default(),
            Arc::new(InMemoryKeyValueStore::new()),
            enqueuer.clone(),
        );
        let mut running = NewJob::new(JobType::EventIngestion, "page")
            .into_job(chrono::Utc::now())
            .unwrap();
        running.metadata.chain_depth = 2;

        let scoped = ctx.scoped_to(&running);
        scoped
            .queue()
            .enqueue(NewJob::new(JobType::EventIngestion, "next"))
            .unwrap();
        ctx.queue().enqueue(NewJob::new(JobType::Cleanup, "unscoped")).unwrap();

        let jobs = enqueuer.jobs.lock().unwrap();
        assert_eq!(jobs[0].metadata.parent_job_id, Some(running.id));
        assert_eq!(jobs[0].metadata.chain_depth, 3);
        assert_eq!(jobs[0].metadata.correlation_id, running.metadata.correlation_id);
        assert_eq!(jobs[0].metadata.plugin_id.as_deref(), Some("github"));
        assert_eq!(jobs[1].metadata.parent_job_id, None);
        assert_eq!(jobs[1].metadata.chain_depth, 0);
        assert_eq!(scoped.queue().parent().map(|j| j.id), Some(running.id));
        assert!(ctx.queue().parent().is_none());
    }
}
