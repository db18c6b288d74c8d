//! Job system: durable queue, dispatcher, and the handlers that run jobs.
//!
//! ## Design
//!
//! - Jobs are validated on submission and persisted before any worker sees them
//! - Workers claim jobs atomically; a job is never run by two workers at once
//! - Transient failures are retried with backoff until attempts run out
//! - Every execution is bounded by the job's timeout
//! - Concurrency is limited per plugin capability
//!
//! ## Components
//!
//! - `JobStore`: versioned persistence with atomic claim
//! - `JobQueue`: submission, cancellation, waiting for results
//! - `Dispatcher`: worker pool that routes claimed jobs to a `JobHandler`
//! - `PluginJobHandler`: ingestion, webhook and scheduled jobs via plugins
//! - `IdentityResolutionHandler` / `KeywordExtractionHandler`: event post-processing

pub mod dispatcher;
pub mod handler;
pub mod plugin_handler;
pub mod processing;
pub mod queue;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handler::{JobHandler, JobOutcome};
pub use plugin_handler::PluginJobHandler;
pub use processing::{IdentityResolutionHandler, KeywordExtractionHandler};
pub use queue::{JobQueue, SubmitError};
pub use store::{modify, InMemoryJobStore, JobFilter, JobStats, JobStore, JobStoreError};
