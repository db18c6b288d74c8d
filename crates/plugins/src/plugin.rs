//! The plugin trait. Implement it to add an event source or task runner.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use drowl_core::{DomainError, DomainResult, ExecutionError, JobId, JobType, JsonObject};
use drowl_events::EventDraft;

use crate::config::ResolvedConfig;
use crate::context::{EnqueueError, PluginContext, StorageError};

/// Arguments for one ingestion batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestParams {
    /// Opaque cursor returned by the previous batch.
    pub cursor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    /// The full job input, for plugin-specific parameters.
    pub input: JsonObject,
}

impl IngestParams {
    /// Read the well-known keys (`cursor`, `since`, `limit`) from job input.
    pub fn from_input(input: &JsonObject) -> DomainResult<Self> {
        let cursor = match input.get("cursor") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(DomainError::validation("input.cursor must be a string")),
        };
        let since = match input.get("since") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| DomainError::validation(format!("input.since: {e}")))?
                    .with_timezone(&Utc),
            ),
            Some(_) => return Err(DomainError::validation("input.since must be an RFC 3339 string")),
        };
        let limit = match input.get("limit") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| DomainError::validation("input.limit must be a positive integer"))?,
            ),
        };
        Ok(Self {
            cursor,
            since,
            limit,
            input: input.clone(),
        })
    }
}

/// One page of ingested events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub events: Vec<EventDraft>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

impl IngestBatch {
    /// Final page.
    pub fn done(events: Vec<EventDraft>) -> Self {
        Self {
            events,
            cursor: None,
            has_more: false,
        }
    }

    /// More pages follow, starting at `cursor`.
    pub fn page(events: Vec<EventDraft>, cursor: impl Into<String>) -> Self {
        Self {
            events,
            cursor: Some(cursor.into()),
            has_more: true,
        }
    }
}

/// Inbound webhook delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub payload: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl WebhookRequest {
    pub fn from_value(value: &Value) -> DomainResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| DomainError::validation(format!("malformed webhook input: {e}")))
    }
}

/// What a scheduled task run is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub job_id: JobId,
    pub job_type: JobType,
    pub name: String,
    pub input: JsonObject,
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

impl From<PluginError> for ExecutionError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::InvalidInput(msg) | PluginError::Config(msg) => ExecutionError::Validation(msg),
            PluginError::NotImplemented(op) => ExecutionError::CapabilityNotSupported(op.to_string()),
            other => ExecutionError::Transient(other.to_string()),
        }
    }
}

/// A third-party extension.
///
/// Only the lifecycle hooks are required to exist; operational methods
/// default to `NotImplemented` and are never called unless the manifest
/// declares the matching capability. Long-running operations should watch
/// `cancel`: once it fires the result is discarded anyway.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called exactly once before any other operation.
    async fn init(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn start(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    async fn stop(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// `event_ingestion` capability.
    async fn ingest_events(
        &self,
        _ctx: &PluginContext,
        _params: IngestParams,
        _cancel: CancellationToken,
    ) -> Result<IngestBatch, PluginError> {
        Err(PluginError::NotImplemented("ingest_events"))
    }

    /// `webhook` capability.
    async fn handle_webhook(
        &self,
        _ctx: &PluginContext,
        _request: WebhookRequest,
        _cancel: CancellationToken,
    ) -> Result<Vec<EventDraft>, PluginError> {
        Err(PluginError::NotImplemented("handle_webhook"))
    }

    /// `scheduled` capability.
    async fn run_scheduled_task(
        &self,
        _ctx: &PluginContext,
        _task: ScheduledTask,
        _cancel: CancellationToken,
    ) -> Result<JsonObject, PluginError> {
        Err(PluginError::NotImplemented("run_scheduled_task"))
    }

    /// Plugin-specific checks on top of the schema.
    fn validate_config(&self, _config: &ResolvedConfig) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn ingest_params_read_well_known_keys() {
        let params = IngestParams::from_input(&object(json!({
            "cursor": "page-2",
            "since": "2024-05-01T00:00:00Z",
            "limit": 50,
            "repo": "drowl"
        })))
        .unwrap();

        assert_eq!(params.cursor.as_deref(), Some("page-2"));
        assert_eq!(params.limit, Some(50));
        assert!(params.since.is_some());
        assert_eq!(params.input.get("repo"), Some(&json!("drowl")));
    }

    #[test]
    fn ingest_params_reject_wrong_types() {
        assert!(IngestParams::from_input(&object(json!({"cursor": 3}))).is_err());
        assert!(IngestParams::from_input(&object(json!({"since": "yesterday"}))).is_err());
        assert!(IngestParams::from_input(&object(json!({"limit": -1}))).is_err());
    }

    #[test]
    fn plugin_errors_map_onto_execution_taxonomy() {
        assert!(matches!(
            ExecutionError::from(PluginError::InvalidInput("x".into())),
            ExecutionError::Validation(_)
        ));
        assert!(matches!(
            ExecutionError::from(PluginError::NotImplemented("handle_webhook")),
            ExecutionError::CapabilityNotSupported(_)
        ));
        assert!(ExecutionError::from(PluginError::Transient("rate limited".into())).is_retryable());
    }
}
