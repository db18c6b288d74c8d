//! Handler seam between the dispatcher and whatever executes a job.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use drowl_core::{ExecutionError, Job, JobType, JsonObject, NewJob};
use drowl_events::Event;

/// What a successful execution produced.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub output: JsonObject,
    /// Events to persist and publish once the job is recorded as completed.
    pub events: Vec<Event>,
    /// Follow-up job in the same chain (next ingestion page).
    pub continuation: Option<NewJob>,
}

impl JobOutcome {
    pub fn output(output: JsonObject) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }
}

/// Executes jobs of one or more types.
///
/// Implementations should watch `cancel`: it fires when the job's deadline
/// elapses, and anything returned afterwards is discarded.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_types(&self) -> Vec<JobType>;

    /// Whether the handler can take `job_type` right now. Jobs of
    /// unavailable types stay pending.
    fn is_available(&self, _job_type: JobType) -> bool {
        true
    }

    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<JobOutcome, ExecutionError>;
}
