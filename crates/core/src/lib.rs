//! `drowl-core`: shared primitives for the job orchestration core.
//!
//! This crate contains **pure domain** types (no IO, no async): identifiers,
//! the job model and its state machine, retry backoff, and the vocabulary
//! shared by plugins, events and identities.

pub mod backoff;
pub mod confidence;
pub mod error;
pub mod execution;
pub mod id;
pub mod job;
pub mod platform;
pub mod version;

pub use backoff::{BackoffPolicy, BackoffStrategy};
pub use confidence::ConfidenceLevel;
pub use error::{DomainError, DomainResult};
pub use execution::ExecutionError;
pub use id::{EventId, IdentityId, IdentityLinkId, JobId, KeywordId, KeywordMatchId};
pub use job::{
    AttemptOutcome, FailureDisposition, Job, JobAttemptRecord, JobError, JobMetadata, JobStatus,
    JobType, JsonObject, NewJob, RetryState, StatusTransition,
};
pub use platform::{EventSource, Platform};
pub use version::ExpectedVersion;
