//! Lifecycle and capability enforcement around a plugin instance.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drowl_core::{ExecutionError, Job, JsonObject};
use drowl_events::{Event, EventDraft, EventMetadata};

use crate::capability::Capability;
use crate::context::PluginContext;
use crate::manifest::PluginManifest;
use crate::plugin::{IngestParams, Plugin, PluginError, ScheduledTask, WebhookRequest};

/// Where a plugin is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Validated and registered; `init` has not completed.
    Registered = 0,
    Initialized = 1,
    Running = 2,
    Stopped = 3,
    /// `init` failed or the plugin rejected its configuration.
    Failed = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Registered,
            1 => LifecycleState::Initialized,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopped,
            _ => LifecycleState::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("plugin `{plugin_id}` is {state:?}; expected {expected}")]
    InvalidState {
        plugin_id: String,
        state: LifecycleState,
        expected: &'static str,
    },
    #[error("plugin `{plugin_id}` rejected its configuration: {reason}")]
    ConfigRejected { plugin_id: String, reason: String },
    #[error("plugin `{plugin_id}` lifecycle hook failed: {source}")]
    Hook {
        plugin_id: String,
        #[source]
        source: PluginError,
    },
}

/// Events from one ingestion call, already stamped.
#[derive(Debug, Clone, Default)]
pub struct IngestedBatch {
    pub events: Vec<Event>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// A registered plugin plus the state the core keeps about it.
///
/// Operational methods check the declared capability and the lifecycle state
/// before plugin code runs.
pub struct PluginRuntime {
    manifest: Arc<PluginManifest>,
    plugin: Arc<dyn Plugin>,
    context: PluginContext,
    state: AtomicU8,
    lifecycle: Mutex<()>,
}

impl PluginRuntime {
    pub fn new(manifest: PluginManifest, plugin: Arc<dyn Plugin>, context: PluginContext) -> Self {
        Self {
            manifest: Arc::new(manifest),
            plugin,
            context,
            state: AtomicU8::new(LifecycleState::Registered as u8),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Initialized (or started) and not yet stopped.
    pub fn is_available(&self) -> bool {
        matches!(self.state(), LifecycleState::Initialized | LifecycleState::Running)
    }

    /// Run `init` exactly once.
    pub async fn init(&self) -> Result<(), RuntimeError> {
        let _guard = self.lifecycle.lock().await;

        let state = self.state();
        if state != LifecycleState::Registered {
            return Err(self.invalid_state(state, "registered"));
        }

        if let Err(reason) = self.plugin.validate_config(self.context.config()) {
            self.set_state(LifecycleState::Failed);
            warn!(plugin_id = %self.id(), reason = %reason, "plugin rejected its configuration");
            return Err(RuntimeError::ConfigRejected {
                plugin_id: self.id().to_string(),
                reason,
            });
        }

        match self.plugin.init(&self.context).await {
            Ok(()) => {
                self.set_state(LifecycleState::Initialized);
                info!(
                    plugin_id = %self.id(),
                    version = %self.manifest.version,
                    "plugin initialized"
                );
                Ok(())
            }
            Err(source) => {
                self.set_state(LifecycleState::Failed);
                error!(plugin_id = %self.id(), error = %source, "plugin init failed");
                Err(self.hook_error(source))
            }
        }
    }

    pub async fn start(&self) -> Result<(), RuntimeError> {
        let _guard = self.lifecycle.lock().await;

        match self.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Initialized => {
                self.plugin
                    .start(&self.context)
                    .await
                    .map_err(|e| self.hook_error(e))?;
                self.set_state(LifecycleState::Running);
                debug!(plugin_id = %self.id(), "plugin started");
                Ok(())
            }
            other => Err(self.invalid_state(other, "initialized")),
        }
    }

    /// Stop the plugin. The plugin is unavailable afterwards even if `stop` fails.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let _guard = self.lifecycle.lock().await;

        match self.state() {
            LifecycleState::Initialized | LifecycleState::Running => {
                let result = self.plugin.stop(&self.context).await;
                self.set_state(LifecycleState::Stopped);
                match result {
                    Ok(()) => {
                        info!(plugin_id = %self.id(), "plugin stopped");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(plugin_id = %self.id(), error = %e, "plugin stop hook failed");
                        Err(self.hook_error(e))
                    }
                }
            }
            LifecycleState::Stopped => Ok(()),
            LifecycleState::Registered | LifecycleState::Failed => {
                self.set_state(LifecycleState::Stopped);
                Ok(())
            }
        }
    }

    /// Operational calls made on behalf of `job` see a context whose queue
    /// enqueues children of that job.
    fn context_for(&self, job: Option<&Job>) -> Cow<'_, PluginContext> {
        match job {
            Some(job) => Cow::Owned(self.context.scoped_to(job)),
            None => Cow::Borrowed(&self.context),
        }
    }

    pub async fn ingest_events(
        &self,
        params: IngestParams,
        job: Option<&Job>,
        cancel: CancellationToken,
    ) -> Result<IngestedBatch, ExecutionError> {
        self.ensure(Capability::EventIngestion)?;

        let ctx = self.context_for(job);
        let batch = self.plugin.ingest_events(&ctx, params, cancel).await?;

        Ok(IngestedBatch {
            events: self.stamp(batch.events, correlation_id(job))?,
            cursor: batch.cursor,
            has_more: batch.has_more,
        })
    }

    pub async fn handle_webhook(
        &self,
        request: WebhookRequest,
        job: Option<&Job>,
        cancel: CancellationToken,
    ) -> Result<Vec<Event>, ExecutionError> {
        self.ensure(Capability::Webhook)?;

        let ctx = self.context_for(job);
        let drafts = self.plugin.handle_webhook(&ctx, request, cancel).await?;

        self.stamp(drafts, correlation_id(job))
    }

    pub async fn run_scheduled_task(
        &self,
        task: ScheduledTask,
        job: Option<&Job>,
        cancel: CancellationToken,
    ) -> Result<JsonObject, ExecutionError> {
        self.ensure(Capability::Scheduled)?;

        let ctx = self.context_for(job);
        Ok(self.plugin.run_scheduled_task(&ctx, task, cancel).await?)
    }

    fn ensure(&self, capability: Capability) -> Result<(), ExecutionError> {
        if !self.manifest.has_capability(capability) {
            return Err(ExecutionError::capability_not_supported(format!(
                "plugin `{}` does not declare `{capability}`",
                self.id()
            )));
        }
        if !self.is_available() {
            return Err(ExecutionError::transient(format!(
                "plugin `{}` is not available ({:?})",
                self.id(),
                self.state()
            )));
        }
        Ok(())
    }

    fn stamp(
        &self,
        drafts: Vec<EventDraft>,
        correlation_id: Option<&str>,
    ) -> Result<Vec<Event>, ExecutionError> {
        let ingested_at = Utc::now();
        drafts
            .into_iter()
            .map(|draft| {
                if !self.manifest.supports_source(draft.source) {
                    return Err(ExecutionError::validation(format!(
                        "plugin `{}` returned an event from undeclared source `{}`",
                        self.id(),
                        draft.source
                    )));
                }
                let metadata = EventMetadata {
                    plugin_id: self.id().to_string(),
                    plugin_version: self.manifest.version.to_string(),
                    correlation_id: correlation_id.map(str::to_string),
                };
                draft
                    .into_event(metadata, ingested_at)
                    .map_err(|e| ExecutionError::validation(e.to_string()))
            })
            .collect()
    }

    fn invalid_state(&self, state: LifecycleState, expected: &'static str) -> RuntimeError {
        RuntimeError::InvalidState {
            plugin_id: self.id().to_string(),
            state,
            expected,
        }
    }

    fn hook_error(&self, source: PluginError) -> RuntimeError {
        RuntimeError::Hook {
            plugin_id: self.id().to_string(),
            source,
        }
    }
}

fn correlation_id(job: Option<&Job>) -> Option<&str> {
    job.and_then(|j| j.metadata.correlation_id.as_deref())
}

impl core::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("id", &self.manifest.id)
            .field("version", &self.manifest.version)
            .field("state", &self.state())
            .finish()
    }
}
