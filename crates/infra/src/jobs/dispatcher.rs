//! Job dispatcher: claims pending jobs, runs them under a deadline, and
//! applies the retry policy.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use drowl_core::{
    BackoffPolicy, EventId, ExecutionError, FailureDisposition, Job, JobType, NewJob,
};
use drowl_plugins::Capability;

use crate::config::EngineConfig;
use crate::event_store::EventStore;

use super::handler::{JobHandler, JobOutcome};
use super::queue::JobQueue;
use super::store::{modify, JobStore, JobStoreError};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    /// How often idle workers poll for newly eligible jobs
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    pub max_batches_per_chain: u32,
    pub auto_process_events: bool,
    pub max_concurrent_per_capability: usize,
    pub concurrency_overrides: HashMap<Capability, usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for DispatcherConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            poll_interval: config.poll_interval,
            backoff: config.backoff(),
            max_batches_per_chain: config.max_batches_per_chain,
            auto_process_events: config.auto_process_events,
            max_concurrent_per_capability: config.max_concurrent_per_capability,
            concurrency_overrides: config.concurrency_overrides.clone(),
        }
    }
}

impl DispatcherConfig {
    fn concurrency_for(&self, capability: Capability) -> usize {
        self.concurrency_overrides
            .get(&capability)
            .copied()
            .unwrap_or(self.max_concurrent_per_capability)
            .max(1)
    }
}

/// A held concurrency permit. Releasing it wakes an idle worker, since a job
/// of that capability may now be claimable.
struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    wake: Arc<Notify>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.permit.take();
        self.wake.notify_one();
    }
}

struct Running {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

/// Pool of workers pulling from the shared job store.
///
/// Handlers are registered up front; a job type without a handler is never
/// claimed and simply stays pending.
pub struct Dispatcher {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

struct Inner {
    queue: JobQueue,
    store: Arc<dyn JobStore>,
    events: Arc<dyn EventStore>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    /// Job types grouped by the capability whose permit they need.
    routes: BTreeMap<Capability, Vec<JobType>>,
    limits: HashMap<Capability, Arc<Semaphore>>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        events: Arc<dyn EventStore>,
        handlers: Vec<Arc<dyn JobHandler>>,
        config: DispatcherConfig,
    ) -> Self {
        let mut by_type: HashMap<JobType, Arc<dyn JobHandler>> = HashMap::new();
        for handler in handlers {
            for job_type in handler.job_types() {
                if by_type.insert(job_type, handler.clone()).is_some() {
                    warn!(job_type = %job_type, "job type registered twice; last handler wins");
                }
            }
        }

        let mut routes: BTreeMap<Capability, Vec<JobType>> = BTreeMap::new();
        for job_type in by_type.keys() {
            routes
                .entry(Capability::for_job_type(*job_type))
                .or_default()
                .push(*job_type);
        }
        for types in routes.values_mut() {
            types.sort();
        }

        let limits = Capability::ALL
            .iter()
            .map(|cap| (*cap, Arc::new(Semaphore::new(config.concurrency_for(*cap)))))
            .collect();

        Self {
            inner: Arc::new(Inner {
                store: queue.store().clone(),
                queue,
                events,
                handlers: by_type,
                routes,
                limits,
                config,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn handles(&self, job_type: JobType) -> bool {
        self.inner.handlers.contains_key(&job_type)
    }

    /// Spawn the worker pool. No-op if already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let workers = (0..self.inner.config.worker_count)
            .map(|worker| {
                let inner = self.inner.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker_loop(inner, worker, shutdown).await })
            })
            .collect();
        info!(workers = self.inner.config.worker_count, "dispatcher started");
        *running = Some(Running { shutdown, workers });
    }

    /// Stop claiming new jobs and wait for in-flight executions to finish.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.shutdown.cancel();
        for worker in running.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatcher worker panicked");
            }
        }
        info!("dispatcher stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Claim and execute at most one job on the calling task. Returns whether
    /// a job was claimed.
    pub async fn run_once(&self) -> Result<bool, JobStoreError> {
        self.inner.dispatch_next().await
    }
}

async fn worker_loop(inner: Arc<Inner>, worker: usize, shutdown: CancellationToken) {
    info!(worker, "dispatcher worker started");
    let wake = inner.queue.wake_handle();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match inner.dispatch_next().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => error!(worker, error = %e, "failed to claim job"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }

    info!(worker, "dispatcher worker stopped");
}

impl Inner {
    async fn dispatch_next(&self) -> Result<bool, JobStoreError> {
        // Only offer job types whose capability has a free slot.
        let mut permits: HashMap<Capability, OwnedSemaphorePermit> = HashMap::new();
        let mut job_types = Vec::new();
        for (capability, types) in &self.routes {
            let available: Vec<JobType> = types
                .iter()
                .copied()
                .filter(|t| self.handlers.get(t).is_some_and(|h| h.is_available(*t)))
                .collect();
            if available.is_empty() {
                continue;
            }
            let Some(limit) = self.limits.get(capability) else {
                continue;
            };
            let Ok(permit) = limit.clone().try_acquire_owned() else {
                continue;
            };
            permits.insert(*capability, permit);
            job_types.extend(available);
        }
        if job_types.is_empty() {
            return Ok(false);
        }

        let Some(job) = self.store.claim_next(&job_types, Utc::now())? else {
            return Ok(false);
        };
        let capability = Capability::for_job_type(job.job_type);
        let Some(permit) = permits.remove(&capability) else {
            // claim_next only returns requested types, each of which has a permit.
            error!(
                job_id = %job.id,
                capability = %capability,
                "claimed job without a concurrency permit"
            );
            return Ok(true);
        };
        drop(permits);

        let slot = Slot {
            permit: Some(permit),
            wake: self.queue.wake_handle(),
        };
        self.execute(job, slot).await;
        Ok(true)
    }

    async fn execute(&self, job: Job, slot: Slot) {
        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            let reason = format!("no handler for {}", job.job_type);
            self.fail(&job, ExecutionError::capability_not_supported(reason));
            return;
        };

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.retry.attempt + 1,
            timeout_ms = job.timeout_ms,
            "job started"
        );

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let mut task = {
            let job = job.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { handler.handle(&job, cancel).await })
        };

        let result = tokio::time::timeout(job.timeout(), &mut task).await;
        match result {
            Ok(Ok(Ok(outcome))) => self.complete(&job, outcome, started).await,
            Ok(Ok(Err(err))) => self.fail(&job, err),
            Ok(Err(join_error)) => {
                let reason = if join_error.is_panic() {
                    "handler panicked"
                } else {
                    "handler aborted"
                };
                self.fail(&job, ExecutionError::transient(reason));
            }
            Err(_) => {
                cancel.cancel();
                self.time_out(&job);
                // The permit stays held until the plugin call actually returns.
                let job_id = job.id;
                tokio::spawn(async move {
                    let _slot = slot;
                    if let Ok(Ok(_)) = task.await {
                        debug!(job_id = %job_id, "discarding late result");
                    }
                });
                return;
            }
        }
        drop(slot);
    }

    async fn complete(&self, job: &Job, outcome: JobOutcome, started: Instant) {
        let JobOutcome {
            mut output,
            events,
            continuation,
        } = outcome;

        let mut new_events: Vec<EventId> = Vec::new();
        for event in events {
            let event_id = event.id;
            match self.events.append(event) {
                Ok(true) => new_events.push(event_id),
                Ok(false) => debug!(job_id = %job.id, event_id = %event_id, "event already stored"),
                Err(e) => {
                    warn!(job_id = %job.id, event_id = %event_id, error = %e, "event not stored")
                }
            }
        }

        let continuation = continuation.map(|next| next.child_of(job)).filter(|next| {
            let within = next.metadata.chain_depth < self.config.max_batches_per_chain;
            if !within {
                warn!(
                    job_id = %job.id,
                    chain_depth = next.metadata.chain_depth,
                    max_batches_per_chain = self.config.max_batches_per_chain,
                    "pagination chain limit reached; not scheduling next batch"
                );
                output.insert("chain_limit_reached".to_string(), Value::Bool(true));
            }
            within
        });

        let now = Utc::now();
        let stored = match modify(&*self.store, job.id, |j| j.mark_completed(output.clone(), now)) {
            Ok((stored, ())) => stored,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record job completion");
                return;
            }
        };
        info!(
            job_id = %stored.id,
            job_type = %stored.job_type,
            duration_ms = started.elapsed().as_millis() as u64,
            events = new_events.len(),
            "job completed"
        );

        if let Some(next) = continuation {
            self.submit_follow_up(&stored, next);
        }

        if self.config.auto_process_events
            && stored.job_type == JobType::EventIngestion
            && !new_events.is_empty()
        {
            let ids: Vec<String> = new_events.iter().map(ToString::to_string).collect();
            for job_type in [JobType::IdentityResolution, JobType::KeywordExtraction] {
                if !self.handlers.contains_key(&job_type) {
                    continue;
                }
                let mut follow_up = NewJob::new(job_type, format!("{job_type} for {}", stored.name))
                    .with_input_value("event_ids", json!(ids))
                    .child_of(&stored);
                // Post-processing does not extend the ingestion chain.
                follow_up.metadata.chain_depth = stored.metadata.chain_depth;
                self.submit_follow_up(&stored, follow_up);
            }
        }

        self.queue.publish_settled(&stored);
    }

    fn submit_follow_up(&self, parent: &Job, next: NewJob) {
        match self.queue.submit(next) {
            Ok(child) => debug!(
                job_id = %parent.id,
                child_job_id = %child.id,
                job_type = %child.job_type,
                "follow-up job submitted"
            ),
            Err(e) => error!(job_id = %parent.id, error = %e, "failed to submit follow-up job"),
        }
    }

    fn fail(&self, job: &Job, err: ExecutionError) {
        let retryable = err.is_retryable();
        let job_error = err.to_job_error();
        let backoff = self.config.backoff;

        let result = modify(&*self.store, job.id, |j| {
            j.mark_failed(job_error.clone(), retryable, &backoff, Utc::now())
        });
        match result {
            Ok((stored, FailureDisposition::Retry { delay, .. })) => {
                warn!(
                    job_id = %stored.id,
                    attempt = stored.retry.attempt,
                    max_attempts = stored.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "job failed; retry scheduled"
                );
                let wake = self.queue.wake_handle();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    wake.notify_one();
                });
            }
            Ok((stored, FailureDisposition::Exhausted)) => {
                error!(
                    job_id = %stored.id,
                    attempt = stored.retry.attempt,
                    code = err.code(),
                    error = %err,
                    "job failed"
                );
                self.queue.publish_settled(&stored);
            }
            Err(e) => error!(job_id = %job.id, error = %e, "failed to record job failure"),
        }
    }

    fn time_out(&self, job: &Job) {
        match modify(&*self.store, job.id, |j| j.mark_timed_out(Utc::now())) {
            Ok((stored, ())) => {
                warn!(job_id = %stored.id, timeout_ms = stored.timeout_ms, "job timed out");
                self.queue.publish_settled(&stored);
            }
            Err(e) => error!(job_id = %job.id, error = %e, "failed to record job timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use drowl_core::{JobStatus, JsonObject};

    use crate::event_store::InMemoryEventStore;
    use crate::jobs::store::InMemoryJobStore;

    /// Fails `failures` times, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        error: ExecutionError,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        fn job_types(&self) -> Vec<JobType> {
            vec![JobType::Analytics]
        }

        async fn handle(
            &self,
            _job: &Job,
            _cancel: CancellationToken,
        ) -> Result<JobOutcome, ExecutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.error.clone());
            }
            let mut output = JsonObject::new();
            output.insert("call".into(), json!(call));
            Ok(JobOutcome::output(output))
        }
    }

    /// Sleeps for `hold`, ignoring cancellation, and tracks how many calls
    /// overlap.
    struct Slow {
        hold: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Slow {
        fn new(hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                hold,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Slow {
        fn job_types(&self) -> Vec<JobType> {
            vec![JobType::Analytics, JobType::Cleanup]
        }

        async fn handle(
            &self,
            _job: &Job,
            _cancel: CancellationToken,
        ) -> Result<JobOutcome, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(JobOutcome::output(JsonObject::new()))
        }
    }

    fn limited(capability: Capability, limit: usize, workers: usize) -> DispatcherConfig {
        DispatcherConfig {
            worker_count: workers,
            concurrency_overrides: HashMap::from([(capability, limit)]),
            ..config()
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        fn job_types(&self) -> Vec<JobType> {
            vec![JobType::Cleanup]
        }

        async fn handle(
            &self,
            _job: &Job,
            _cancel: CancellationToken,
        ) -> Result<JobOutcome, ExecutionError> {
            panic!("boom");
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            worker_count: 2,
            poll_interval: Duration::from_millis(5),
            backoff: BackoffPolicy::new(Duration::ZERO, Duration::ZERO),
            ..DispatcherConfig::default()
        }
    }

    fn dispatcher(handlers: Vec<Arc<dyn JobHandler>>) -> (Dispatcher, JobQueue) {
        dispatcher_with(handlers, config())
    }

    fn dispatcher_with(
        handlers: Vec<Arc<dyn JobHandler>>,
        config: DispatcherConfig,
    ) -> (Dispatcher, JobQueue) {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let events = Arc::new(InMemoryEventStore::new());
        let dispatcher = Dispatcher::new(queue.clone(), events, handlers, config);
        (dispatcher, queue)
    }

    fn flaky(failures: usize, error: ExecutionError) -> Arc<Flaky> {
        Arc::new(Flaky {
            failures,
            calls: AtomicUsize::new(0),
            error,
        })
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let handler = flaky(2, ExecutionError::transient("flaky upstream"));
        let (dispatcher, queue) = dispatcher(vec![handler.clone() as Arc<dyn JobHandler>]);
        let job = queue.submit(NewJob::new(JobType::Analytics, "daily")).unwrap();

        for _ in 0..3 {
            assert!(dispatcher.run_once().await.unwrap());
        }

        let job = queue.get(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry.attempt, 2);
        assert_eq!(job.failure_count(), 2);
        assert_eq!(job.attempts.len(), 3);
        assert_eq!(job.output.unwrap()["call"], json!(2));
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let handler = flaky(5, ExecutionError::validation("bad input"));
        let (dispatcher, queue) = dispatcher(vec![handler as Arc<dyn JobHandler>]);
        let job = queue.submit(NewJob::new(JobType::Analytics, "daily")).unwrap();

        assert!(dispatcher.run_once().await.unwrap());
        assert!(!dispatcher.run_once().await.unwrap());

        let job = queue.get(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry.attempt, 1);
        assert_eq!(job.error.unwrap().code.as_deref(), Some("validation_error"));
    }

    #[tokio::test]
    async fn exhausted_jobs_stay_failed() {
        let handler = flaky(10, ExecutionError::transient("down"));
        let (dispatcher, queue) = dispatcher(vec![handler as Arc<dyn JobHandler>]);
        let job = queue
            .submit(NewJob::new(JobType::Analytics, "daily").with_max_attempts(2))
            .unwrap();

        while dispatcher.run_once().await.unwrap() {}

        let job = queue.get(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry.attempt, 2);
        assert_eq!(job.failure_count(), job.retry.attempt);
    }

    #[tokio::test]
    async fn panics_are_contained_as_transient_failures() {
        let (dispatcher, queue) = dispatcher(vec![Arc::new(Panics) as Arc<dyn JobHandler>]);
        let job = queue
            .submit(NewJob::new(JobType::Cleanup, "prune").with_max_attempts(1))
            .unwrap();

        assert!(dispatcher.run_once().await.unwrap());

        let job = queue.get(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().code.as_deref(), Some("transient_error"));
    }

    #[tokio::test]
    async fn unhandled_job_types_stay_pending() {
        let handler = flaky(0, ExecutionError::transient("x"));
        let (dispatcher, queue) = dispatcher(vec![handler as Arc<dyn JobHandler>]);
        let job = queue.submit(NewJob::new(JobType::DataExport, "dump")).unwrap();

        assert!(!dispatcher.run_once().await.unwrap());
        assert_eq!(queue.get(job.id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn workers_drain_the_queue_and_stop() {
        let handler = flaky(0, ExecutionError::transient("x"));
        let (dispatcher, queue) = dispatcher(vec![handler.clone() as Arc<dyn JobHandler>]);
        dispatcher.start().await;

        let ids: Vec<_> = (0..5)
            .map(|i| queue.submit(NewJob::new(JobType::Analytics, format!("job-{i}"))).unwrap().id)
            .collect();
        for id in ids {
            let job = tokio::time::timeout(Duration::from_secs(2), queue.await_terminal(id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }

        dispatcher.shutdown().await;
        assert!(!dispatcher.is_running().await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn running_jobs_never_exceed_the_capability_limit() {
        let handler = Slow::new(Duration::from_millis(30));
        let config = limited(Capability::for_job_type(JobType::Analytics), 2, 8);
        let (dispatcher, queue) =
            dispatcher_with(vec![handler.clone() as Arc<dyn JobHandler>], config);
        dispatcher.start().await;

        let ids: Vec<_> = (0..8)
            .map(|i| NewJob::new(JobType::Analytics, format!("report-{i}")))
            .map(|job| queue.submit(job).unwrap().id)
            .collect();
        for id in ids {
            let job = tokio::time::timeout(Duration::from_secs(5), queue.await_terminal(id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        dispatcher.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 8);
        let peak = handler.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak running analytics jobs = {peak}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timed_out_job_holds_its_slot_until_the_call_returns() {
        let handler = Slow::new(Duration::from_millis(150));
        let mut config = limited(Capability::for_job_type(JobType::Analytics), 1, 4);
        // Only the slot release can wake the workers in time.
        config.poll_interval = Duration::from_secs(60);
        let (dispatcher, queue) =
            dispatcher_with(vec![handler.clone() as Arc<dyn JobHandler>], config);

        let stuck = queue
            .submit(NewJob::new(JobType::Analytics, "stuck").with_timeout_ms(20).with_priority(9))
            .unwrap();
        let next = queue.submit(NewJob::new(JobType::Analytics, "next")).unwrap();
        dispatcher.start().await;

        let stuck = tokio::time::timeout(Duration::from_secs(2), queue.await_terminal(stuck.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stuck.status, JobStatus::Timeout);
        // The abandoned call is still sleeping; its slot is not free yet.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.get(next.id).unwrap().unwrap().status, JobStatus::Pending);

        let next = tokio::time::timeout(Duration::from_secs(2), queue.await_terminal(next.id))
            .await
            .unwrap()
            .unwrap();
        dispatcher.shutdown().await;

        assert_eq!(next.status, JobStatus::Completed);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
    }
}
