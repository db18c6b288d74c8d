//! Append-only store of ingested events.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError};

use chrono::{DateTime, Utc};

use drowl_core::{EventId, EventSource};
use drowl_events::{Event, EventBus};

/// Adapter that publishes newly stored events to an `EventBus` after a
/// successful append.
///
/// This ensures the ordering invariant: **publish happens only after append
/// succeeds**, and a duplicate append publishes nothing.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<Event>,
{
    fn append(&self, event: Event) -> Result<bool, EventStoreError> {
        // 1) Append (durable step)
        let stored = self.store.append(event.clone())?;

        // 2) Publish (best-effort; at-least-once acceptable)
        if stored {
            self.bus
                .publish(event)
                .map_err(|err| EventStoreError::Publish(err.to_string()))?;
        }

        Ok(stored)
    }

    fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        self.store.get(id)
    }

    fn list_by_source(
        &self,
        source: EventSource,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.store.list_by_source(source, since, limit)
    }

    fn len(&self) -> Result<usize, EventStoreError> {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use drowl_events::{EventDraft, EventMetadata, InMemoryEventBus};

    #[test]
    fn duplicates_are_not_republished() {
        let bus = Arc::new(InMemoryEventBus::<Event>::new());
        let sub = bus.subscribe();
        let store = PublishingEventStore::new(InMemoryEventStore::new(), bus.clone());

        let event = EventDraft::new(EventSource::Manual, "note", Utc::now(), "raw/1")
            .into_event(
                EventMetadata {
                    plugin_id: "test".into(),
                    plugin_version: "1.0.0".into(),
                    correlation_id: None,
                },
                Utc::now(),
            )
            .unwrap();

        assert!(store.append(event.clone()).unwrap());
        assert!(!store.append(event.clone()).unwrap());

        let published = sub.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, event.id);
    }
}
