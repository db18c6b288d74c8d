//! Runs plugin-backed jobs: ingestion pages, webhook deliveries and
//! scheduled tasks.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use drowl_core::{ExecutionError, Job, JobType, JsonObject, NewJob};
use drowl_events::Event;
use drowl_plugins::{Capability, IngestParams, PluginRegistry, PluginRuntime, ScheduledTask, WebhookRequest};

use super::handler::{JobHandler, JobOutcome};

const PLUGIN_JOB_TYPES: [JobType; 6] = [
    JobType::EventIngestion,
    JobType::Analytics,
    JobType::ReportGeneration,
    JobType::DataExport,
    JobType::Cleanup,
    JobType::Custom,
];

/// Routes jobs to registered plugins.
///
/// A job pinned with `metadata.plugin_id` always goes to that plugin;
/// otherwise the first available plugin (by id) that declares the job type's
/// capability and supports the job type is used.
pub struct PluginJobHandler {
    registry: Arc<PluginRegistry>,
}

impl PluginJobHandler {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    fn select(&self, job: &Job, operation: Capability) -> Result<Arc<PluginRuntime>, ExecutionError> {
        if let Some(plugin_id) = job.metadata.plugin_id.as_deref() {
            return self.registry.get(plugin_id).ok_or_else(|| {
                ExecutionError::validation(format!("plugin `{plugin_id}` is not registered"))
            });
        }

        let routed = Capability::for_job_type(job.job_type);
        let candidates: Vec<_> = self
            .registry
            .available_for(routed)
            .into_iter()
            .filter(|p| p.manifest().supports_job_type(job.job_type))
            .collect();

        // Prefer a plugin that also declares the operation being invoked.
        candidates
            .iter()
            .find(|p| p.manifest().has_capability(operation))
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| {
                ExecutionError::transient(format!("no available plugin for `{}` jobs", job.job_type))
            })
    }

    async fn ingest(&self, job: &Job, cancel: CancellationToken) -> Result<JobOutcome, ExecutionError> {
        if let Some(webhook) = job.input.get("webhook") {
            let request = WebhookRequest::from_value(webhook)?;
            let plugin = self.select_ingestion(job, Capability::Webhook)?;
            let events = plugin.handle_webhook(request, Some(job), cancel).await?;

            let mut output = summary(&plugin, &events);
            output.insert("webhook".to_string(), Value::Bool(true));
            return Ok(JobOutcome {
                output,
                events,
                continuation: None,
            });
        }

        let params = IngestParams::from_input(&job.input)?;
        let plugin = self.select_ingestion(job, Capability::EventIngestion)?;
        let batch = plugin.ingest_events(params, Some(job), cancel).await?;

        let mut output = summary(&plugin, &batch.events);
        output.insert("cursor".to_string(), json!(batch.cursor));
        output.insert("has_more".to_string(), Value::Bool(batch.has_more));

        let continuation = match (batch.has_more, batch.cursor) {
            (true, Some(cursor)) => {
                let mut input = job.input.clone();
                input.insert("cursor".to_string(), Value::String(cursor));
                debug!(job_id = %job.id, plugin_id = %plugin.id(), "next ingestion page requested");
                Some(
                    NewJob::new(JobType::EventIngestion, job.name.clone())
                        .with_input(input)
                        .with_priority(job.priority)
                        .with_timeout_ms(job.timeout_ms)
                        .with_max_attempts(job.retry.max_attempts)
                        .with_backoff(job.retry.backoff_strategy)
                        .with_plugin(plugin.id()),
                )
            }
            _ => None,
        };

        Ok(JobOutcome {
            output,
            events: batch.events,
            continuation,
        })
    }

    /// Ingestion and webhook plugins are both routed as `event_ingestion`, so
    /// an unpinned webhook delivery looks for webhook plugins directly.
    fn select_ingestion(&self, job: &Job, operation: Capability) -> Result<Arc<PluginRuntime>, ExecutionError> {
        if job.metadata.plugin_id.is_some() || operation == Capability::EventIngestion {
            return self.select(job, operation);
        }
        self.registry
            .available_for(operation)
            .into_iter()
            .find(|p| p.manifest().supports_job_type(job.job_type))
            .ok_or_else(|| ExecutionError::transient("no available webhook plugin"))
    }

    async fn scheduled(&self, job: &Job, cancel: CancellationToken) -> Result<JobOutcome, ExecutionError> {
        let plugin = self.select(job, Capability::Scheduled)?;
        let task = ScheduledTask {
            job_id: job.id,
            job_type: job.job_type,
            name: job.name.clone(),
            input: job.input.clone(),
        };

        let mut output = plugin.run_scheduled_task(task, Some(job), cancel).await?;
        output
            .entry("plugin_id".to_string())
            .or_insert_with(|| Value::String(plugin.id().to_string()));
        Ok(JobOutcome::output(output))
    }
}

fn summary(plugin: &PluginRuntime, events: &[Event]) -> JsonObject {
    let mut output = JsonObject::new();
    output.insert("plugin_id".to_string(), Value::String(plugin.id().to_string()));
    output.insert("event_count".to_string(), json!(events.len()));
    output.insert(
        "event_ids".to_string(),
        Value::Array(events.iter().map(|e| Value::String(e.id.to_string())).collect()),
    );
    output
}

#[async_trait]
impl JobHandler for PluginJobHandler {
    fn job_types(&self) -> Vec<JobType> {
        PLUGIN_JOB_TYPES.to_vec()
    }

    fn is_available(&self, job_type: JobType) -> bool {
        let available = self.registry.has_available(Capability::for_job_type(job_type));
        if job_type == JobType::EventIngestion {
            return available || self.registry.has_available(Capability::Webhook);
        }
        available
    }

    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<JobOutcome, ExecutionError> {
        match job.job_type {
            JobType::EventIngestion => self.ingest(job, cancel).await,
            JobType::IdentityResolution | JobType::KeywordExtraction => Err(ExecutionError::capability_not_supported(
                format!("`{}` jobs are not run by plugins", job.job_type),
            )),
            _ => self.scheduled(job, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use drowl_core::{EventSource, JobId, Platform};
    use drowl_events::{EventActor, EventDraft};
    use drowl_plugins::{
        EnqueueError, InMemoryKeyValueStore, IngestBatch, JobEnqueuer, ManifestDocument, Plugin, PluginContext,
        PluginError, PluginServices,
    };

    struct NoQueue;

    impl JobEnqueuer for NoQueue {
        fn enqueue(&self, _job: NewJob) -> Result<JobId, EnqueueError> {
            Err(EnqueueError("queue disabled in tests".into()))
        }
    }

    /// Serves two pages, then a final one.
    struct Paged;

    #[async_trait]
    impl Plugin for Paged {
        async fn ingest_events(
            &self,
            _ctx: &PluginContext,
            params: IngestParams,
            _cancel: CancellationToken,
        ) -> Result<IngestBatch, PluginError> {
            let page: u32 = params.cursor.as_deref().map_or(Ok(0), str::parse).map_err(|_| {
                PluginError::InvalidInput("cursor".into())
            })?;
            let draft = EventDraft::new(EventSource::DevTo, "post", Utc::now(), format!("page-{page}"))
                .with_actor(EventActor::new(Platform::DevTo, "u1"))
                .with_content(format!("page {page}"));
            Ok(if page < 2 {
                IngestBatch::page(vec![draft], (page + 1).to_string())
            } else {
                IngestBatch::done(vec![draft])
            })
        }

        async fn run_scheduled_task(
            &self,
            _ctx: &PluginContext,
            task: ScheduledTask,
            _cancel: CancellationToken,
        ) -> Result<JsonObject, PluginError> {
            let mut out = JsonObject::new();
            out.insert("task".into(), Value::String(task.name));
            Ok(out)
        }
    }

    async fn registry_with(docs: Vec<ManifestDocument>) -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry::new(PluginServices {
            storage: Arc::new(InMemoryKeyValueStore::new()),
            enqueuer: Arc::new(NoQueue),
        }));
        for doc in docs {
            registry.register(doc, Arc::new(Paged), &JsonObject::new()).unwrap();
        }
        registry.init_all().await;
        registry
    }

    fn job(new_job: NewJob) -> Job {
        new_job.into_job(Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn ingestion_page_requests_the_next_page() {
        let registry = registry_with(vec![
            ManifestDocument::new("devto", "Dev.to", "1.0.0").with_capability(Capability::EventIngestion),
        ])
        .await;
        let handler = PluginJobHandler::new(registry);

        let outcome = handler
            .handle(&job(NewJob::new(JobType::EventIngestion, "sync")), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.output["event_count"], json!(1));
        assert_eq!(outcome.output["has_more"], json!(true));
        let next = outcome.continuation.unwrap();
        assert_eq!(next.input["cursor"], json!("1"));
        assert_eq!(next.metadata.plugin_id.as_deref(), Some("devto"));
    }

    #[tokio::test]
    async fn final_page_has_no_continuation() {
        let registry = registry_with(vec![
            ManifestDocument::new("devto", "Dev.to", "1.0.0").with_capability(Capability::EventIngestion),
        ])
        .await;
        let handler = PluginJobHandler::new(registry);
        let new_job = NewJob::new(JobType::EventIngestion, "sync").with_input_value("cursor", json!("2"));

        let outcome = handler.handle(&job(new_job), CancellationToken::new()).await.unwrap();
        assert!(outcome.continuation.is_none());
        assert_eq!(outcome.output["has_more"], json!(false));
    }

    #[tokio::test]
    async fn pinned_plugin_without_capability_is_rejected() {
        let registry = registry_with(vec![
            ManifestDocument::new("devto", "Dev.to", "1.0.0").with_capability(Capability::EventIngestion),
        ])
        .await;
        let handler = PluginJobHandler::new(registry);
        let new_job = NewJob::new(JobType::EventIngestion, "hook")
            .with_input_value("webhook", json!({"payload": {}}))
            .with_plugin("devto");

        let err = handler.handle(&job(new_job), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::CapabilityNotSupported(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unknown_pinned_plugin_is_a_validation_error() {
        let registry = registry_with(vec![]).await;
        let handler = PluginJobHandler::new(registry);
        let new_job = NewJob::new(JobType::Cleanup, "prune").with_plugin("ghost");

        let err = handler.handle(&job(new_job), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Validation(_)));
    }

    #[tokio::test]
    async fn scheduled_jobs_run_on_the_first_available_plugin() {
        let registry = registry_with(vec![
            ManifestDocument::new("b-tasks", "B", "1.0.0").with_capability(Capability::Scheduled),
            ManifestDocument::new("a-tasks", "A", "1.0.0").with_capability(Capability::Scheduled),
        ])
        .await;
        let handler = PluginJobHandler::new(registry);

        assert!(handler.is_available(JobType::Cleanup));
        assert!(!handler.is_available(JobType::DataExport));

        let outcome = handler
            .handle(&job(NewJob::new(JobType::Cleanup, "prune")), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.output["task"], json!("prune"));
        assert_eq!(outcome.output["plugin_id"], json!("a-tasks"));
    }

    #[tokio::test]
    async fn stopped_plugins_are_not_available() {
        let registry = registry_with(vec![
            ManifestDocument::new("devto", "Dev.to", "1.0.0").with_capability(Capability::EventIngestion),
        ])
        .await;
        let handler = PluginJobHandler::new(registry.clone());
        assert!(handler.is_available(JobType::EventIngestion));

        registry.stop_all().await;
        assert!(!handler.is_available(JobType::EventIngestion));
    }
}
