//! Job storage implementations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use drowl_core::{DomainError, DomainResult, ExpectedVersion, Job, JobId, JobStatus, JobType};

/// Attempts `modify` makes before giving up on a contended job.
const MAX_CAS_RETRIES: usize = 32;

/// Job store abstraction.
///
/// Every write bumps `Job::version`; conditional writes go through
/// [`JobStore::compare_and_swap`].
pub trait JobStore: Send + Sync {
    /// Store a new job at version 1.
    fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Replace a job if the stored version matches `expected`.
    fn compare_and_swap(&self, job: Job, expected: ExpectedVersion) -> Result<Job, JobStoreError>;

    /// Atomically move the best eligible pending job of one of `job_types`
    /// to running: highest priority, then oldest, then lowest id.
    fn claim_next(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Jobs matching `filter`, oldest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {0} was modified concurrently")]
    Conflict(JobId),
    #[error(transparent)]
    InvalidTransition(DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Selection criteria for [`JobStore::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub correlation_id: Option<String>,
    pub parent_job_id: Option<JobId>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn job_type(job_type: JobType) -> Self {
        Self {
            job_type: Some(job_type),
            ..Self::default()
        }
    }

    pub fn children_of(parent: JobId) -> Self {
        Self {
            parent_job_id: Some(parent),
            ..Self::default()
        }
    }

    fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.is_none_or(|t| job.job_type == t)
            && self
                .correlation_id
                .as_deref()
                .is_none_or(|c| job.metadata.correlation_id.as_deref() == Some(c))
            && self
                .parent_job_id
                .is_none_or(|p| job.metadata.parent_job_id == Some(p))
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timeout: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled + self.timeout
    }

    fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Timeout => self.timeout += 1,
        }
    }
}

/// Read-modify-write a job, retrying against fresh state on version
/// conflicts. Returns the stored job and whatever `f` returned.
pub fn modify<S, T, F>(store: &S, id: JobId, mut f: F) -> Result<(Job, T), JobStoreError>
where
    S: JobStore + ?Sized,
    F: FnMut(&mut Job) -> DomainResult<T>,
{
    for _ in 0..MAX_CAS_RETRIES {
        let mut job = store.get(id)?.ok_or(JobStoreError::NotFound(id))?;
        let expected = ExpectedVersion::Exact(job.version);
        let out = f(&mut job).map_err(JobStoreError::InvalidTransition)?;
        match store.compare_and_swap(job, expected) {
            Ok(stored) => return Ok((stored, out)),
            Err(JobStoreError::Conflict(_)) => {
                tracing::debug!(job_id = %id, "job version conflict; retrying");
            }
            Err(e) => return Err(e),
        }
    }
    Err(JobStoreError::Conflict(id))
}

/// In-memory job store for tests/dev.
///
/// Sharded map; each job is locked independently.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, mut job: Job) -> Result<Job, JobStoreError> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(JobStoreError::AlreadyExists(job.id)),
            Entry::Vacant(slot) => {
                job.version = 1;
                slot.insert(job.clone());
                Ok(job)
            }
        }
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.jobs.get(&id).map(|j| j.value().clone()))
    }

    fn compare_and_swap(
        &self,
        mut job: Job,
        expected: ExpectedVersion,
    ) -> Result<Job, JobStoreError> {
        let mut stored = self.jobs.get_mut(&job.id).ok_or(JobStoreError::NotFound(job.id))?;
        if !expected.matches(stored.version) {
            return Err(JobStoreError::Conflict(job.id));
        }
        job.version = stored.version + 1;
        *stored = job.clone();
        Ok(job)
    }

    fn claim_next(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        if job_types.is_empty() {
            return Ok(None);
        }

        let mut candidates: Vec<(u8, DateTime<Utc>, JobId, u64)> = self
            .jobs
            .iter()
            .filter(|j| j.is_eligible(now) && job_types.contains(&j.job_type))
            .map(|j| (j.priority, j.created_at, j.id, j.version))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        for (_, _, id, version) in candidates {
            let Some(mut job) = self.jobs.get_mut(&id) else {
                continue;
            };
            // Lost the race to another worker (or a cancel) since the scan.
            if job.version != version || !job.is_eligible(now) {
                continue;
            }
            job.mark_running(now).map_err(JobStoreError::InvalidTransition)?;
            job.version += 1;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let mut result: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| filter.matches(j.value()))
            .map(|j| j.value().clone())
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for job in self.jobs.iter() {
            stats.count(job.status);
        }
        Ok(stats)
    }
}

impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(id)
    }

    fn compare_and_swap(&self, job: Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        (**self).compare_and_swap(job, expected)
    }

    fn claim_next(
        &self,
        job_types: &[JobType],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(job_types, now)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
