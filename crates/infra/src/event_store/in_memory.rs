use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use drowl_core::{EventId, EventSource};
use drowl_events::Event;

use super::r#trait::{EventStore, EventStoreError};

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: DashMap<EventId, Event>,
    by_source: DashMap<EventSource, BTreeSet<(DateTime<Utc>, EventId)>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: Event) -> Result<bool, EventStoreError> {
        let (source, occurred_at, id) = (event.source, event.occurred_at, event.id);
        match self.events.entry(id) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
        }
        self.by_source
            .entry(source)
            .or_default()
            .insert((occurred_at, id));
        Ok(true)
    }

    fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        Ok(self.events.get(&id).map(|e| e.value().clone()))
    }

    fn list_by_source(
        &self,
        source: EventSource,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Event>, EventStoreError> {
        let keys: Vec<EventId> = match self.by_source.get(&source) {
            Some(index) => index
                .iter()
                .filter(|(at, _)| since.is_none_or(|s| *at >= s))
                .take(limit)
                .map(|(_, id)| *id)
                .collect(),
            None => return Ok(Vec::new()),
        };
        Ok(keys
            .into_iter()
            .filter_map(|id| self.events.get(&id).map(|e| e.value().clone()))
            .collect())
    }

    fn len(&self) -> Result<usize, EventStoreError> {
        Ok(self.events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use drowl_events::{EventDraft, EventMetadata};

    fn event(source: EventSource, occurred_at: DateTime<Utc>) -> Event {
        EventDraft::new(source, "post", occurred_at, "raw/1")
            .into_event(
                EventMetadata {
                    plugin_id: "test".into(),
                    plugin_version: "1.0.0".into(),
                    correlation_id: None,
                },
                Utc::now(),
            )
            .unwrap()
    }

    #[test]
    fn append_is_idempotent_per_event_id() {
        let store = InMemoryEventStore::new();
        let e = event(EventSource::GitHub, Utc::now());

        assert!(store.append(e.clone()).unwrap());
        assert!(!store.append(e.clone()).unwrap());
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(e.id).unwrap(), Some(e));
    }

    #[test]
    fn list_by_source_orders_by_occurrence() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        let late = event(EventSource::Zenn, now);
        let early = event(EventSource::Zenn, now - Duration::hours(2));
        let middle = event(EventSource::Zenn, now - Duration::hours(1));
        store.append(late.clone()).unwrap();
        store.append(early.clone()).unwrap();
        store.append(middle.clone()).unwrap();
        store.append(event(EventSource::Qiita, now)).unwrap();

        let ids: Vec<_> = store
            .list_by_source(EventSource::Zenn, None, 10)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![early.id, middle.id, late.id]);

        let recent = store
            .list_by_source(EventSource::Zenn, Some(now - Duration::minutes(90)), 1)
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, middle.id);
    }
}
