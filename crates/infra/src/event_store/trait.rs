use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use drowl_core::{EventId, EventSource};
use drowl_events::Event;

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, publication) as opposed to
/// domain errors (validation, invariants), which are rejected before an event
/// ever reaches the store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("event storage error: {0}")]
    Storage(String),

    #[error("event publication failed: {0}")]
    Publish(String),
}

/// Append-only store of ingested events.
///
/// ## Design Principles
///
/// - **No storage assumptions**: works with the in-memory implementation
///   (tests/dev) and any durable backend
/// - **Append-only**: events are immutable once stored
/// - **Idempotent append**: appending an event whose id is already stored is
///   a no-op, so a retried ingestion never duplicates events
///
/// ## Indexes
///
/// Events are addressable by id and listable per source in `occurred_at`
/// order, which is what downstream consumers page through.
pub trait EventStore: Send + Sync {
    /// Append one event. Returns `false` if an event with the same id exists.
    fn append(&self, event: Event) -> Result<bool, EventStoreError>;

    fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError>;

    /// Events from `source` with `occurred_at >= since`, oldest first.
    fn list_by_source(
        &self,
        source: EventSource,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Event>, EventStoreError>;

    fn len(&self) -> Result<usize, EventStoreError>;

    fn is_empty(&self) -> Result<bool, EventStoreError> {
        Ok(self.len()? == 0)
    }
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(&self, event: Event) -> Result<bool, EventStoreError> {
        (**self).append(event)
    }

    fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        (**self).get(id)
    }

    fn list_by_source(
        &self,
        source: EventSource,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Event>, EventStoreError> {
        (**self).list_by_source(source, since, limit)
    }

    fn len(&self) -> Result<usize, EventStoreError> {
        (**self).len()
    }
}
