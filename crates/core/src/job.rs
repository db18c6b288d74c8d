//! Job model and its state machine.
//!
//! ```text
//! pending ──▶ running ──▶ completed
//!    │           ├──────▶ timeout
//!    │           └──────▶ failed ──▶ pending   (while attempt < max_attempts)
//!    └──▶ cancelled
//! ```
//!
//! Every transition is appended to `Job::transitions` and every finished
//! execution to `Job::attempts`, so the history of a job is never rewritten.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backoff::{BackoffPolicy, BackoffStrategy};
use crate::error::{DomainError, DomainResult};
use crate::execution::ExecutionError;
use crate::id::JobId;

/// JSON object used for job input and output.
pub type JsonObject = Map<String, Value>;

pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job type, used to route a job to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EventIngestion,
    IdentityResolution,
    KeywordExtraction,
    Analytics,
    ReportGeneration,
    DataExport,
    Cleanup,
    Custom,
}

impl JobType {
    pub const ALL: [JobType; 8] = [
        JobType::EventIngestion,
        JobType::IdentityResolution,
        JobType::KeywordExtraction,
        JobType::Analytics,
        JobType::ReportGeneration,
        JobType::DataExport,
        JobType::Cleanup,
        JobType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EventIngestion => "event_ingestion",
            JobType::IdentityResolution => "identity_resolution",
            JobType::KeywordExtraction => "keyword_extraction",
            JobType::Analytics => "analytics",
            JobType::ReportGeneration => "report_generation",
            JobType::DataExport => "data_export",
            JobType::Cleanup => "cleanup",
            JobType::Custom => "custom",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Completed successfully
    Completed,
    /// Failed with no retries left
    Failed,
    /// Cancelled before it ran
    Cancelled,
    /// Deadline elapsed while running
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }

    /// Terminal states never re-enter `running`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Timeout)
                | (JobStatus::Failed, JobStatus::Pending)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a job that failed or timed out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }
}

/// Retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryState {
    /// Number of failed executions so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_strategy: BackoffStrategy::default(),
            last_retry_at: None,
        }
    }
}

impl RetryState {
    /// `max_attempts == 0` behaves like a single attempt.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts.max(1)
    }
}

/// Routing and lineage metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    /// Pins the job to one plugin.
    pub plugin_id: Option<String>,
    pub user_id: Option<String>,
    /// Shared by every job in a chain; defaults to the first job's id.
    pub correlation_id: Option<String>,
    pub parent_job_id: Option<JobId>,
    pub tags: Vec<String>,
    /// Number of follow-up hops from the job that started the chain.
    pub chain_depth: u32,
}

/// One entry of the append-only status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    /// 1-based execution number.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What happened to a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending`, selectable again at `eligible_at`.
    Retry {
        delay: Duration,
        eligible_at: DateTime<Utc>,
    },
    /// Stays `failed`; no more attempts.
    Exhausted,
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub name: String,
    pub status: JobStatus,
    /// 0–10, higher is served first.
    pub priority: u8,
    pub input: JsonObject,
    pub output: Option<JsonObject>,
    /// Present only while the job is `failed` or `timeout`.
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    /// First dispatch.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the job reaches a final state.
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub retry: RetryState,
    pub metadata: JobMetadata,
    /// Earliest time the dispatcher may select the job.
    pub eligible_at: DateTime<Utc>,
    /// Bumped by the store on every write.
    pub version: u64,
    pub transitions: Vec<StatusTransition>,
    pub attempts: Vec<JobAttemptRecord>,
}

impl Job {
    /// Final from the caller's point of view: terminal, or failed with no retries left.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() || self.status == JobStatus::Failed
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.eligible_at <= now
    }

    /// Number of `running → failed` transitions in the history.
    pub fn failure_count(&self) -> u32 {
        let count = self
            .transitions
            .iter()
            .filter(|t| t.from == JobStatus::Running && t.to == JobStatus::Failed)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// When the current (or most recent) execution started.
    pub fn running_since(&self) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .rev()
            .find(|t| t.to == JobStatus::Running)
            .map(|t| t.at)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Mark job as running.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Running, now)?;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, output: JsonObject, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Completed, now)?;
        self.record_attempt(AttemptOutcome::Succeeded, None, now);
        self.output = Some(output);
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Mark job as failed and apply the retry policy.
    ///
    /// The attempt counter is incremented before deciding; a retryable
    /// failure with attempts left puts the job back to `pending`.
    pub fn mark_failed(
        &mut self,
        error: JobError,
        retryable: bool,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<FailureDisposition> {
        self.transition(JobStatus::Failed, now)?;
        self.record_attempt(AttemptOutcome::Failed, Some(error.message.clone()), now);
        self.retry.attempt = self.retry.attempt.saturating_add(1);
        self.error = Some(error);

        if !retryable || !self.retry.has_attempts_left() {
            self.completed_at = Some(now);
            return Ok(FailureDisposition::Exhausted);
        }

        let delay = backoff.delay_for_attempt(self.retry.backoff_strategy, self.retry.attempt);
        let eligible_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        self.transition(JobStatus::Pending, now)?;
        self.retry.last_retry_at = Some(now);
        self.eligible_at = eligible_at;
        self.error = None;

        Ok(FailureDisposition::Retry { delay, eligible_at })
    }

    /// Mark job as timed out. Terminal; the attempt counter is left alone.
    pub fn mark_timed_out(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Timeout, now)?;
        let error = ExecutionError::Timeout(self.timeout_ms).to_job_error();
        self.record_attempt(AttemptOutcome::TimedOut, Some(error.message.clone()), now);
        self.error = Some(error);
        self.completed_at = Some(now);
        Ok(())
    }

    /// Mark job as cancelled. Only pending jobs can be cancelled.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Cancelled, now)?;
        self.completed_at = Some(now);
        Ok(())
    }

    fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> DomainResult<()> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(DomainError::invalid_transition(from, to));
        }
        if from == JobStatus::Failed && !self.retry.has_attempts_left() {
            return Err(DomainError::invalid_transition(from, to));
        }
        self.transitions.push(StatusTransition { from, to, at: now });
        self.status = to;
        Ok(())
    }

    fn record_attempt(&mut self, outcome: AttemptOutcome, error: Option<String>, now: DateTime<Utc>) {
        let started_at = self.running_since().unwrap_or(now);
        let attempt = u32::try_from(self.attempts.len() + 1).unwrap_or(u32::MAX);
        self.attempts.push(JobAttemptRecord {
            attempt,
            started_at,
            finished_at: now,
            outcome,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Submission request; the core assigns id, status and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub name: String,
    #[serde(default)]
    pub input: JsonObject,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_strategy: Option<BackoffStrategy>,
    #[serde(default)]
    pub metadata: JobMetadata,
    /// Delay the first dispatch until this time.
    #[serde(default)]
    pub eligible_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: JobType, name: impl Into<String>) -> Self {
        Self {
            job_type,
            name: name.into(),
            input: JsonObject::new(),
            priority: None,
            timeout_ms: None,
            max_attempts: None,
            backoff_strategy: None,
            metadata: JobMetadata::default(),
            eligible_at: None,
        }
    }

    /// Parse an untrusted JSON submission.
    pub fn from_json(value: Value) -> DomainResult<Self> {
        let job: NewJob = serde_json::from_value(value)
            .map_err(|e| DomainError::validation(format!("malformed job submission: {e}")))?;
        job.validate()?;
        Ok(job)
    }

    pub fn with_input(mut self, input: JsonObject) -> Self {
        self.input = input;
        self
    }

    pub fn with_input_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = Some(strategy);
        self
    }

    pub fn with_plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.metadata.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: JobMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn eligible_at(mut self, at: DateTime<Utc>) -> Self {
        self.eligible_at = Some(at);
        self
    }

    /// Follow-up of `parent`: same correlation id, one hop deeper.
    pub fn child_of(mut self, parent: &Job) -> Self {
        self.metadata.parent_job_id = Some(parent.id);
        self.metadata.correlation_id = parent
            .metadata
            .correlation_id
            .clone()
            .or_else(|| Some(parent.id.to_string()));
        self.metadata.chain_depth = parent.metadata.chain_depth.saturating_add(1);
        if self.metadata.user_id.is_none() {
            self.metadata.user_id = parent.metadata.user_id.clone();
        }
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("job name must not be empty"));
        }
        if name.len() > 255 {
            return Err(DomainError::validation("job name must be at most 255 characters"));
        }
        if let Some(priority) = self.priority {
            if priority > MAX_PRIORITY {
                return Err(DomainError::validation(format!(
                    "priority must be between 0 and {MAX_PRIORITY}, got {priority}"
                )));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(DomainError::validation("timeout_ms must be positive"));
        }
        Ok(())
    }

    /// Validate and turn the request into a pending job.
    pub fn into_job(self, now: DateTime<Utc>) -> DomainResult<Job> {
        self.validate()?;

        let id = JobId::new();
        let mut metadata = self.metadata;
        if metadata.correlation_id.is_none() {
            metadata.correlation_id = Some(id.to_string());
        }

        Ok(Job {
            id,
            job_type: self.job_type,
            name: self.name.trim().to_string(),
            status: JobStatus::Pending,
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            input: self.input,
            output: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            timeout_ms: self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            retry: RetryState {
                max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                backoff_strategy: self.backoff_strategy.unwrap_or_default(),
                ..RetryState::default()
            },
            metadata,
            eligible_at: self.eligible_at.unwrap_or(now),
            version: 0,
            transitions: Vec::new(),
            attempts: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn no_delay() -> BackoffPolicy {
        BackoffPolicy::new(Duration::ZERO, Duration::ZERO)
    }

    fn pending_job(max_attempts: u32) -> Job {
        NewJob::new(JobType::Custom, "test")
            .with_max_attempts(max_attempts)
            .into_job(Utc::now())
            .unwrap()
    }

    #[test]
    fn defaults_are_applied_on_submission() {
        let job = NewJob::new(JobType::Analytics, "  nightly  ").into_job(Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.name, "nightly");
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(job.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.retry.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(job.metadata.correlation_id, Some(job.id.to_string()));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = pending_job(3);
        let now = Utc::now();

        job.mark_running(now).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.started_at, Some(now));

        let mut output = JsonObject::new();
        output.insert("rows".into(), json!(3));
        job.mark_completed(output, now).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts.len(), 1);
        assert_eq!(job.attempts[0].outcome, AttemptOutcome::Succeeded);
        assert!(job.completed_at.is_some());
        assert!(job.mark_running(now).is_err());
    }

    #[test]
    fn failure_requeues_with_backoff_until_exhausted() {
        let backoff = BackoffPolicy::new(Duration::from_millis(1000), Duration::from_secs(60));
        let mut job = pending_job(2);
        let now = Utc::now();

        job.mark_running(now).unwrap();
        let first = job
            .mark_failed(JobError::new("boom"), true, &backoff, now)
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry.attempt, 1);
        assert_eq!(job.retry.last_retry_at, Some(now));
        assert!(job.error.is_none());
        match first {
            FailureDisposition::Retry { delay, eligible_at } => {
                assert_eq!(delay, Duration::from_millis(1000));
                assert_eq!(eligible_at, job.eligible_at);
                assert!(!job.is_eligible(now));
            }
            FailureDisposition::Exhausted => panic!("expected a retry"),
        }

        job.mark_running(job.eligible_at).unwrap();
        let second = job
            .mark_failed(JobError::new("boom again"), true, &backoff, now)
            .unwrap();

        assert_eq!(second, FailureDisposition::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry.attempt, 2);
        assert_eq!(job.error.as_ref().map(|e| e.message.as_str()), Some("boom again"));
        assert!(job.is_settled());
    }

    #[test]
    fn non_retryable_failure_is_final() {
        let mut job = pending_job(5);
        job.mark_running(Utc::now()).unwrap();

        let disposition = job
            .mark_failed(JobError::new("bad input"), false, &no_delay(), Utc::now())
            .unwrap();

        assert_eq!(disposition, FailureDisposition::Exhausted);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry.attempt, 1);
    }

    #[test]
    fn zero_max_attempts_behaves_like_one() {
        let mut job = pending_job(0);
        job.mark_running(Utc::now()).unwrap();

        let disposition = job
            .mark_failed(JobError::new("boom"), true, &no_delay(), Utc::now())
            .unwrap();

        assert_eq!(disposition, FailureDisposition::Exhausted);
    }

    #[test]
    fn timeout_is_terminal_and_does_not_count_as_failure() {
        let mut job = pending_job(3);
        job.mark_running(Utc::now()).unwrap();
        job.mark_timed_out(Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(job.retry.attempt, 0);
        assert_eq!(job.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert_eq!(job.error.as_ref().and_then(|e| e.code.as_deref()), Some("timeout_error"));
        assert!(job.mark_completed(JsonObject::new(), Utc::now()).is_err());
    }

    #[test]
    fn only_pending_jobs_can_be_cancelled() {
        let mut job = pending_job(3);
        job.mark_running(Utc::now()).unwrap();
        assert!(matches!(
            job.mark_cancelled(Utc::now()),
            Err(DomainError::InvalidTransition { .. })
        ));

        let mut job = pending_job(3);
        job.mark_cancelled(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn from_json_rejects_bad_submissions() {
        assert!(NewJob::from_json(json!({"type": "event_ingestion"})).is_err());
        assert!(NewJob::from_json(json!({"type": "nope", "name": "x"})).is_err());
        assert!(NewJob::from_json(json!({"type": "cleanup", "name": "x", "priority": 11})).is_err());
        assert!(NewJob::from_json(json!({"type": "cleanup", "name": " "})).is_err());

        let job = NewJob::from_json(json!({
            "type": "event_ingestion",
            "name": "pull github",
            "input": {"repo": "drowl"},
            "priority": 8,
            "metadata": {"plugin_id": "github"}
        }))
        .unwrap();
        assert_eq!(job.job_type, JobType::EventIngestion);
        assert_eq!(job.priority, Some(8));
        assert_eq!(job.metadata.plugin_id.as_deref(), Some("github"));
    }

    #[test]
    fn child_inherits_correlation_and_deepens_chain() {
        let parent = pending_job(3);
        let child = NewJob::new(JobType::EventIngestion, "next page").child_of(&parent);

        assert_eq!(child.metadata.parent_job_id, Some(parent.id));
        assert_eq!(child.metadata.correlation_id, parent.metadata.correlation_id);
        assert_eq!(child.metadata.chain_depth, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn attempt_always_equals_failure_transitions(
            max_attempts in 0u32..6,
            outcomes in proptest::collection::vec(any::<bool>(), 1..12),
        ) {
            let mut job = pending_job(max_attempts);
            let now = Utc::now();

            for fail in outcomes {
                if job.status != JobStatus::Pending {
                    break;
                }
                job.mark_running(now).unwrap();
                if fail {
                    job.mark_failed(JobError::new("x"), true, &no_delay(), now).unwrap();
                } else {
                    job.mark_completed(JsonObject::new(), now).unwrap();
                }
                prop_assert_eq!(job.retry.attempt, job.failure_count());
            }

            if job.status == JobStatus::Failed {
                prop_assert!(!job.retry.has_attempts_left());
                prop_assert!(job.mark_running(now).is_err());
            }
            prop_assert!(job.retry.attempt <= max_attempts.max(1));
        }
    }
}
