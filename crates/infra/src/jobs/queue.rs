//! Submission side of the job system.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::info;

use drowl_core::{DomainError, Job, JobId, NewJob};
use drowl_plugins::{EnqueueError, JobEnqueuer};

use super::store::{modify, JobFilter, JobStats, JobStore, JobStoreError};

const SETTLED_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Front door of the job system: validates submissions, wakes workers, and
/// lets callers wait for results.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    wake: Arc<Notify>,
    settled: broadcast::Sender<Job>,
    /// Submissions at or past this `chain_depth` are rejected.
    chain_limit: Option<u32>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let (settled, _) = broadcast::channel(SETTLED_CHANNEL_CAPACITY);
        Self {
            store,
            wake: Arc::new(Notify::new()),
            settled,
            chain_limit: None,
        }
    }

    /// Reject jobs whose `chain_depth` reaches `max_batches_per_chain`.
    pub fn with_chain_limit(mut self, max_batches_per_chain: u32) -> Self {
        self.chain_limit = Some(max_batches_per_chain.max(1));
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Validate and store a job; the core assigns id, status and timestamps.
    pub fn submit(&self, new_job: NewJob) -> Result<Job, SubmitError> {
        if let Some(limit) = self.chain_limit {
            let depth = new_job.metadata.chain_depth;
            if depth >= limit {
                return Err(DomainError::validation(format!(
                    "chain depth {depth} reaches the limit of {limit} jobs per chain"
                ))
                .into());
            }
        }
        let job = new_job.into_job(Utc::now())?;
        let job = self.store.insert(job)?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            correlation_id = job.metadata.correlation_id.as_deref().unwrap_or_default(),
            "job submitted"
        );
        self.wake.notify_one();
        Ok(job)
    }

    /// Cancel a pending job.
    pub fn cancel(&self, id: JobId) -> Result<Job, SubmitError> {
        let (job, ()) = modify(&*self.store, id, |job| job.mark_cancelled(Utc::now()))?;
        info!(job_id = %id, "job cancelled");
        self.publish_settled(&job);
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        self.store.list(filter)
    }

    pub fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats()
    }

    /// Resolve once the job is terminal, or failed with no retries left.
    pub async fn await_terminal(&self, id: JobId) -> Result<Job, JobStoreError> {
        // Subscribe before reading so a settle in between is not missed.
        let mut rx = self.settled.subscribe();
        if let Some(job) = self.settled_job(id)? {
            return Ok(job);
        }
        loop {
            match rx.recv().await {
                Ok(job) if job.id == id && job.is_settled() => return Ok(job),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(job) = self.settled_job(id)? {
                        return Ok(job);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(JobStoreError::Storage("job queue closed".to_string()));
                }
            }
        }
    }

    fn settled_job(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let job = self.store.get(id)?.ok_or(JobStoreError::NotFound(id))?;
        Ok(job.is_settled().then_some(job))
    }

    pub(crate) fn publish_settled(&self, job: &Job) {
        // No receivers is fine; nobody is waiting.
        let _ = self.settled.send(job.clone());
    }
}

impl JobEnqueuer for JobQueue {
    fn enqueue(&self, job: NewJob) -> Result<JobId, EnqueueError> {
        self.submit(job)
            .map(|job| job.id)
            .map_err(|e| EnqueueError(e.to_string()))
    }
}

impl core::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use drowl_core::{JobStatus, JobType};
    use drowl_plugins::PluginQueue;

    use crate::jobs::store::InMemoryJobStore;

    fn queue() -> JobQueue {
        JobQueue::new(InMemoryJobStore::arc())
    }

    #[test]
    fn submit_rejects_invalid_jobs() {
        let err = queue().submit(NewJob::new(JobType::Cleanup, "   ")).unwrap_err();
        assert!(matches!(err, SubmitError::Invalid(_)));
    }

    #[test]
    fn submit_rejects_jobs_past_the_chain_limit() {
        let queue = queue().with_chain_limit(3);
        let root = queue.submit(NewJob::new(JobType::EventIngestion, "page")).unwrap();

        let mut deep = NewJob::new(JobType::EventIngestion, "page");
        deep.metadata.chain_depth = 10_000;
        assert!(matches!(queue.submit(deep), Err(SubmitError::Invalid(_))));

        let child = queue
            .submit(NewJob::new(JobType::EventIngestion, "page").child_of(&root))
            .unwrap();
        let grandchild = queue
            .submit(NewJob::new(JobType::EventIngestion, "page").child_of(&child))
            .unwrap();
        assert_eq!(grandchild.metadata.chain_depth, 2);
        assert!(matches!(
            queue.submit(NewJob::new(JobType::EventIngestion, "page").child_of(&grandchild)),
            Err(SubmitError::Invalid(_))
        ));
    }

    #[test]
    fn plugins_cannot_enqueue_past_the_chain_limit() {
        let queue = queue().with_chain_limit(2);
        let root = queue.submit(NewJob::new(JobType::EventIngestion, "page")).unwrap();
        let plugin_queue = PluginQueue::new("github", Arc::new(queue.clone())).scoped_to(&root);

        let child_id = plugin_queue
            .enqueue(NewJob::new(JobType::EventIngestion, "next"))
            .unwrap();
        let child = queue.get(child_id).unwrap().unwrap();
        assert_eq!(child.metadata.parent_job_id, Some(root.id));
        assert_eq!(child.metadata.chain_depth, 1);

        let from_child = plugin_queue.scoped_to(&child);
        assert!(from_child.enqueue(NewJob::new(JobType::EventIngestion, "next")).is_err());
        assert_eq!(queue.stats().unwrap().total(), 2);
    }

    #[test]
    fn submit_assigns_identity_and_defaults() {
        let job = queue().submit(NewJob::new(JobType::Analytics, "daily")).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 5);
        assert_eq!(job.timeout_ms, 300_000);
        assert_eq!(job.retry.max_attempts, 3);
        assert_eq!(job.metadata.correlation_id, Some(job.id.to_string()));
    }

    #[test]
    fn only_pending_jobs_can_be_cancelled() {
        let queue = queue();
        let job = queue.submit(NewJob::new(JobType::Cleanup, "prune")).unwrap();
        queue.store().claim_next(&[JobType::Cleanup], Utc::now()).unwrap();

        assert!(matches!(
            queue.cancel(job.id),
            Err(SubmitError::Store(JobStoreError::InvalidTransition(_)))
        ));
    }

    #[tokio::test]
    async fn await_terminal_sees_cancellation() {
        let queue = queue();
        let job = queue.submit(NewJob::new(JobType::Cleanup, "prune")).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.await_terminal(job.id).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.cancel(job.id).unwrap();

        let settled = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn await_terminal_returns_immediately_for_settled_jobs() {
        let queue = queue();
        let job = queue.submit(NewJob::new(JobType::Cleanup, "prune")).unwrap();
        queue.cancel(job.id).unwrap();

        let settled = queue.await_terminal(job.id).await.unwrap();
        assert_eq!(settled.status, JobStatus::Cancelled);
        assert!(matches!(
            queue.await_terminal(JobId::new()).await,
            Err(JobStoreError::NotFound(_))
        ));
    }
}
