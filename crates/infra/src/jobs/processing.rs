//! Built-in handlers that post-process stored events.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use drowl_core::{EventId, ExecutionError, Job, JobType, JsonObject};
use drowl_events::Event;
use drowl_identity::IdentityResolver;
use drowl_keywords::{KeywordMatcher, KeywordStore};

use crate::event_store::EventStore;

use super::handler::{JobHandler, JobOutcome};

/// Parse `input.event_ids` (an array of event id strings).
fn event_ids(job: &Job) -> Result<Vec<EventId>, ExecutionError> {
    let Some(Value::Array(raw)) = job.input.get("event_ids") else {
        return Err(ExecutionError::validation("input.event_ids must be an array of event ids"));
    };
    raw.iter()
        .map(|v| {
            v.as_str()
                .and_then(|s| s.parse::<EventId>().ok())
                .ok_or_else(|| ExecutionError::validation(format!("invalid event id: {v}")))
        })
        .collect()
}

/// Load events, skipping ids that are not stored.
fn load_events(
    store: &dyn EventStore,
    ids: &[EventId],
    job: &Job,
) -> Result<Vec<Event>, ExecutionError> {
    let mut events = Vec::with_capacity(ids.len());
    for id in ids {
        match store.get(*id).map_err(|e| ExecutionError::transient(e.to_string()))? {
            Some(event) => events.push(event),
            None => debug!(job_id = %job.id, event_id = %id, "event not found; skipping"),
        }
    }
    Ok(events)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), ExecutionError> {
    if cancel.is_cancelled() {
        return Err(ExecutionError::transient("cancelled"));
    }
    Ok(())
}

/// `identity_resolution` jobs: resolve the actor of each event.
pub struct IdentityResolutionHandler {
    resolver: Arc<IdentityResolver>,
    events: Arc<dyn EventStore>,
}

impl IdentityResolutionHandler {
    pub fn new(resolver: Arc<IdentityResolver>, events: Arc<dyn EventStore>) -> Self {
        Self { resolver, events }
    }
}

#[async_trait]
impl JobHandler for IdentityResolutionHandler {
    fn job_types(&self) -> Vec<JobType> {
        vec![JobType::IdentityResolution]
    }

    async fn handle(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, ExecutionError> {
        let ids = event_ids(job)?;
        let events = load_events(&*self.events, &ids, job)?;

        let mut resolved = 0usize;
        let mut created = 0usize;
        let mut links = 0usize;
        let mut skipped = 0usize;
        for event in &events {
            check_cancelled(&cancel)?;
            let resolution = self
                .resolver
                .resolve(event)
                .map_err(|e| ExecutionError::transient(e.to_string()))?;
            if resolution.already_processed {
                skipped += 1;
                continue;
            }
            if resolution.identity.is_some() {
                resolved += 1;
            }
            created += usize::from(resolution.created_identity);
            links += resolution.links.len();
        }

        info!(job_id = %job.id, resolved, created, links, skipped, "identity resolution finished");
        let mut output = JsonObject::new();
        output.insert("events".to_string(), json!(events.len()));
        output.insert("resolved".to_string(), json!(resolved));
        output.insert("identities_created".to_string(), json!(created));
        output.insert("links_created".to_string(), json!(links));
        output.insert("already_processed".to_string(), json!(skipped));
        Ok(JobOutcome::output(output))
    }
}

/// `keyword_extraction` jobs: match active keywords against each event.
pub struct KeywordExtractionHandler {
    matcher: Arc<KeywordMatcher>,
    keywords: Arc<dyn KeywordStore>,
    events: Arc<dyn EventStore>,
}

impl KeywordExtractionHandler {
    pub fn new(
        matcher: Arc<KeywordMatcher>,
        keywords: Arc<dyn KeywordStore>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            matcher,
            keywords,
            events,
        }
    }
}

#[async_trait]
impl JobHandler for KeywordExtractionHandler {
    fn job_types(&self) -> Vec<JobType> {
        vec![JobType::KeywordExtraction]
    }

    async fn handle(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, ExecutionError> {
        let ids = event_ids(job)?;
        let events = load_events(&*self.events, &ids, job)?;
        let keywords = self
            .keywords
            .active_keywords()
            .map_err(|e| ExecutionError::transient(e.to_string()))?;

        let mut recorded = 0usize;
        let mut failures = Vec::new();
        for event in &events {
            check_cancelled(&cancel)?;
            let report = self.matcher.match_event(&keywords, event);
            for m in report.matches {
                if self
                    .keywords
                    .record_match(m)
                    .map_err(|e| ExecutionError::transient(e.to_string()))?
                {
                    recorded += 1;
                }
            }
            failures.extend(report.failures);
        }

        info!(
            job_id = %job.id,
            events = events.len(),
            matches = recorded,
            failures = failures.len(),
            "keyword extraction finished"
        );
        let mut output = JsonObject::new();
        output.insert("events".to_string(), json!(events.len()));
        output.insert("keywords".to_string(), json!(keywords.len()));
        output.insert("matches_recorded".to_string(), json!(recorded));
        if !failures.is_empty() {
            output.insert(
                "pattern_failures".to_string(),
                Value::Array(
                    failures
                        .iter()
                        .map(|f| {
                            json!({
                                "keyword_id": f.keyword_id.to_string(),
                                "pattern": f.pattern,
                                "reason": f.reason,
                            })
                        })
                        .collect(),
                ),
            );
        }
        Ok(JobOutcome::output(output))
    }
}
