//! Identity storage.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use drowl_core::{DomainError, EventId, IdentityId, IdentityLinkId};
use drowl_events::EventActor;

use crate::model::{normalize_email, Identity, IdentityKey, IdentityLink};

#[derive(Debug, Error)]
pub enum IdentityStoreError {
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("identity link not found: {0}")]
    LinkNotFound(IdentityLinkId),
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Identity store abstraction.
///
/// Writes to one identity (or one identity pair, for links) are serialised;
/// unrelated identities proceed independently.
pub trait IdentityStore: Send + Sync {
    /// Create or refresh the identity behind an event actor.
    /// Returns the stored identity and whether it was created.
    fn observe(
        &self,
        actor: &EventActor,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Identity, bool), IdentityStoreError>;

    /// Get or create a profile-less identity for a referenced account.
    fn ensure(
        &self,
        key: &IdentityKey,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Identity, bool), IdentityStoreError>;

    fn get(&self, id: IdentityId) -> Result<Option<Identity>, IdentityStoreError>;

    fn find_by_key(&self, key: &IdentityKey) -> Result<Option<Identity>, IdentityStoreError>;

    fn find_by_verified_email(&self, email: &str) -> Result<Vec<Identity>, IdentityStoreError>;

    /// Case-insensitive.
    fn find_by_username(&self, username: &str) -> Result<Vec<Identity>, IdentityStoreError>;

    fn set_identity_active(&self, id: IdentityId, active: bool) -> Result<Identity, IdentityStoreError>;

    /// Insert `link` unless the pair already has a link of the same or higher
    /// confidence (active or not). Returns the inserted link.
    fn insert_link_if_stronger(&self, link: IdentityLink) -> Result<Option<IdentityLink>, IdentityStoreError>;

    fn get_link(&self, id: IdentityLinkId) -> Result<Option<IdentityLink>, IdentityStoreError>;

    fn links_for(&self, id: IdentityId) -> Result<Vec<IdentityLink>, IdentityStoreError>;

    fn links_between(&self, a: IdentityId, b: IdentityId) -> Result<Vec<IdentityLink>, IdentityStoreError>;

    fn set_link_active(&self, id: IdentityLinkId, active: bool) -> Result<IdentityLink, IdentityStoreError>;

    /// Record that `event_id` was resolved. Returns `false` if it already was.
    fn mark_event_processed(&self, event_id: EventId) -> Result<bool, IdentityStoreError>;

    fn identity_count(&self) -> Result<usize, IdentityStoreError>;

    fn link_count(&self) -> Result<usize, IdentityStoreError>;
}

/// In-memory identity store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    identities: DashMap<IdentityId, Identity>,
    by_key: DashMap<IdentityKey, IdentityId>,
    // Secondary indexes are additive; lookups re-check the current value.
    by_email: DashMap<String, BTreeSet<IdentityId>>,
    by_username: DashMap<String, BTreeSet<IdentityId>>,
    links: DashMap<IdentityLinkId, IdentityLink>,
    links_by_pair: DashMap<(IdentityId, IdentityId), Vec<IdentityLinkId>>,
    links_by_identity: DashMap<IdentityId, Vec<IdentityLinkId>>,
    processed_events: DashMap<EventId, ()>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn index(&self, identity: &Identity) {
        if let Some(email) = &identity.verified_email {
            self.by_email.entry(email.clone()).or_default().insert(identity.id);
        }
        if let Some(username) = &identity.platform_username {
            self.by_username
                .entry(username.to_lowercase())
                .or_default()
                .insert(identity.id);
        }
    }

    fn lookup(&self, ids: Option<BTreeSet<IdentityId>>) -> Vec<Identity> {
        ids.unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.identities.get(&id).map(|i| i.value().clone()))
            .collect()
    }

    fn upsert(
        &self,
        key: IdentityKey,
        create: impl FnOnce() -> Identity,
        update: impl FnOnce(&mut Identity),
    ) -> Result<(Identity, bool), IdentityStoreError> {
        // The key entry is held for the whole upsert, serialising writers of
        // the same account.
        let (identity, created) = match self.by_key.entry(key) {
            Entry::Occupied(slot) => {
                let id = *slot.get();
                let mut stored = self
                    .identities
                    .get_mut(&id)
                    .ok_or(IdentityStoreError::NotFound(id))?;
                update(&mut stored);
                (stored.clone(), false)
            }
            Entry::Vacant(slot) => {
                let identity = create();
                self.identities.insert(identity.id, identity.clone());
                slot.insert(identity.id);
                (identity, true)
            }
        };
        self.index(&identity);
        Ok((identity, created))
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn observe(
        &self,
        actor: &EventActor,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Identity, bool), IdentityStoreError> {
        self.upsert(
            actor.account(),
            || Identity::observed(actor, occurred_at, now),
            |identity| identity.refresh(actor, occurred_at),
        )
    }

    fn ensure(
        &self,
        key: &IdentityKey,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Identity, bool), IdentityStoreError> {
        self.upsert(key.clone(), || Identity::discovered(key, occurred_at, now), |_| {})
    }

    fn get(&self, id: IdentityId) -> Result<Option<Identity>, IdentityStoreError> {
        Ok(self.identities.get(&id).map(|i| i.value().clone()))
    }

    fn find_by_key(&self, key: &IdentityKey) -> Result<Option<Identity>, IdentityStoreError> {
        let id = self.by_key.get(key).map(|id| *id.value());
        Ok(id.and_then(|id| self.identities.get(&id).map(|i| i.value().clone())))
    }

    fn find_by_verified_email(&self, email: &str) -> Result<Vec<Identity>, IdentityStoreError> {
        let email = normalize_email(email);
        let ids = self.by_email.get(&email).map(|ids| ids.value().clone());
        Ok(self
            .lookup(ids)
            .into_iter()
            .filter(|i| i.verified_email.as_deref() == Some(email.as_str()))
            .collect())
    }

    fn find_by_username(&self, username: &str) -> Result<Vec<Identity>, IdentityStoreError> {
        let username = username.trim().to_lowercase();
        let ids = self.by_username.get(&username).map(|ids| ids.value().clone());
        Ok(self
            .lookup(ids)
            .into_iter()
            .filter(|i| {
                i.platform_username
                    .as_deref()
                    .is_some_and(|u| u.to_lowercase() == username)
            })
            .collect())
    }

    fn set_identity_active(&self, id: IdentityId, active: bool) -> Result<Identity, IdentityStoreError> {
        let mut identity = self
            .identities
            .get_mut(&id)
            .ok_or(IdentityStoreError::NotFound(id))?;
        identity.is_active = active;
        Ok(identity.clone())
    }

    fn insert_link_if_stronger(&self, link: IdentityLink) -> Result<Option<IdentityLink>, IdentityStoreError> {
        let (a, b) = link.pair();
        {
            let mut pair_links = self.links_by_pair.entry((a, b)).or_default();
            let strongest = pair_links
                .iter()
                .filter_map(|id| self.links.get(id).map(|l| l.confidence))
                .max();
            if strongest.is_some_and(|existing| existing >= link.confidence) {
                return Ok(None);
            }
            self.links.insert(link.id, link.clone());
            pair_links.push(link.id);
        }
        for side in [a, b] {
            self.links_by_identity.entry(side).or_default().push(link.id);
        }
        Ok(Some(link))
    }

    fn get_link(&self, id: IdentityLinkId) -> Result<Option<IdentityLink>, IdentityStoreError> {
        Ok(self.links.get(&id).map(|l| l.value().clone()))
    }

    fn links_for(&self, id: IdentityId) -> Result<Vec<IdentityLink>, IdentityStoreError> {
        let ids = self
            .links_by_identity
            .get(&id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.links.get(&id).map(|l| l.value().clone()))
            .collect())
    }

    fn links_between(&self, a: IdentityId, b: IdentityId) -> Result<Vec<IdentityLink>, IdentityStoreError> {
        let pair = crate::model::ordered_pair(a, b);
        let ids = self
            .links_by_pair
            .get(&pair)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.links.get(&id).map(|l| l.value().clone()))
            .collect())
    }

    fn set_link_active(&self, id: IdentityLinkId, active: bool) -> Result<IdentityLink, IdentityStoreError> {
        let mut link = self
            .links
            .get_mut(&id)
            .ok_or(IdentityStoreError::LinkNotFound(id))?;
        link.is_active = active;
        Ok(link.clone())
    }

    fn mark_event_processed(&self, event_id: EventId) -> Result<bool, IdentityStoreError> {
        Ok(self.processed_events.insert(event_id, ()).is_none())
    }

    fn identity_count(&self) -> Result<usize, IdentityStoreError> {
        Ok(self.identities.len())
    }

    fn link_count(&self) -> Result<usize, IdentityStoreError> {
        Ok(self.links.len())
    }
}

impl<T: IdentityStore + ?Sized> IdentityStore for Arc<T> {
    fn observe(
        &self,
        actor: &EventActor,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Identity, bool), IdentityStoreError> {
        (**self).observe(actor, occurred_at, now)
    }

    fn ensure(
        &self,
        key: &IdentityKey,
        occurred_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Identity, bool), IdentityStoreError> {
        (**self).ensure(key, occurred_at, now)
    }

    fn get(&self, id: IdentityId) -> Result<Option<Identity>, IdentityStoreError> {
        (**self).get(id)
    }

    fn find_by_key(&self, key: &IdentityKey) -> Result<Option<Identity>, IdentityStoreError> {
        (**self).find_by_key(key)
    }

    fn find_by_verified_email(&self, email: &str) -> Result<Vec<Identity>, IdentityStoreError> {
        (**self).find_by_verified_email(email)
    }

    fn find_by_username(&self, username: &str) -> Result<Vec<Identity>, IdentityStoreError> {
        (**self).find_by_username(username)
    }

    fn set_identity_active(&self, id: IdentityId, active: bool) -> Result<Identity, IdentityStoreError> {
        (**self).set_identity_active(id, active)
    }

    fn insert_link_if_stronger(&self, link: IdentityLink) -> Result<Option<IdentityLink>, IdentityStoreError> {
        (**self).insert_link_if_stronger(link)
    }

    fn get_link(&self, id: IdentityLinkId) -> Result<Option<IdentityLink>, IdentityStoreError> {
        (**self).get_link(id)
    }

    fn links_for(&self, id: IdentityId) -> Result<Vec<IdentityLink>, IdentityStoreError> {
        (**self).links_for(id)
    }

    fn links_between(&self, a: IdentityId, b: IdentityId) -> Result<Vec<IdentityLink>, IdentityStoreError> {
        (**self).links_between(a, b)
    }

    fn set_link_active(&self, id: IdentityLinkId, active: bool) -> Result<IdentityLink, IdentityStoreError> {
        (**self).set_link_active(id, active)
    }

    fn mark_event_processed(&self, event_id: EventId) -> Result<bool, IdentityStoreError> {
        (**self).mark_event_processed(event_id)
    }

    fn identity_count(&self) -> Result<usize, IdentityStoreError> {
        (**self).identity_count()
    }

    fn link_count(&self) -> Result<usize, IdentityStoreError> {
        (**self).link_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use drowl_core::{ConfidenceLevel, Platform};
    use drowl_events::PlatformAccount;

    use crate::model::{LinkMetadata, LinkSource};

    fn link(a: IdentityId, b: IdentityId, confidence: ConfidenceLevel) -> IdentityLink {
        IdentityLink::new(a, b, confidence, LinkSource::PluginHeuristic, "test", LinkMetadata::default(), Utc::now()).unwrap()
    }

    #[test]
    fn observe_creates_once_per_account() {
        let store = InMemoryIdentityStore::new();
        let actor = EventActor::new(Platform::GitHub, "42").with_username("octo");
        let now = Utc::now();

        let (first, created) = store.observe(&actor, now, now).unwrap();
        assert!(created);
        let (second, created) = store.observe(&actor, now, now).unwrap();
        assert!(!created);

        assert_eq!(first.id, second.id);
        assert_eq!(store.identity_count().unwrap(), 1);
        assert_eq!(store.find_by_username("OCTO").unwrap().len(), 1);
    }

    #[test]
    fn concurrent_observations_of_one_account_create_one_identity() {
        let store = InMemoryIdentityStore::arc();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    let actor = EventActor::new(Platform::X, "same");
                    store.observe(&actor, Utc::now(), Utc::now()).unwrap().0.id
                })
            })
            .collect();

        let ids: BTreeSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.identity_count().unwrap(), 1);
    }

    #[test]
    fn weaker_or_equal_links_are_not_duplicated() {
        let store = InMemoryIdentityStore::new();
        let a = IdentityId::new();
        let b = IdentityId::new();

        assert!(store.insert_link_if_stronger(link(a, b, ConfidenceLevel::Medium)).unwrap().is_some());
        assert!(store.insert_link_if_stronger(link(b, a, ConfidenceLevel::Medium)).unwrap().is_none());
        assert!(store.insert_link_if_stronger(link(a, b, ConfidenceLevel::Low)).unwrap().is_none());
        assert!(store.insert_link_if_stronger(link(a, b, ConfidenceLevel::High)).unwrap().is_some());

        assert_eq!(store.links_between(a, b).unwrap().len(), 2);
        assert_eq!(store.links_for(b).unwrap().len(), 2);
    }

    #[test]
    fn verified_email_lookup_tracks_current_value() {
        let store = InMemoryIdentityStore::new();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(1);

        store
            .observe(&EventActor::new(Platform::GitHub, "1").with_verified_email("Old@Example.com"), now, now)
            .unwrap();
        store
            .observe(&EventActor::new(Platform::GitHub, "1").with_verified_email("new@example.com"), later, later)
            .unwrap();

        assert!(store.find_by_verified_email("old@example.com").unwrap().is_empty());
        assert_eq!(store.find_by_verified_email("NEW@example.com").unwrap().len(), 1);
    }

    #[test]
    fn ensure_does_not_touch_existing_profile() {
        let store = InMemoryIdentityStore::new();
        let now = Utc::now();
        let actor = EventActor::new(Platform::GitHub, "7").with_display_name("Seven");
        store.observe(&actor, now, now).unwrap();

        let (identity, created) = store
            .ensure(&PlatformAccount::new(Platform::GitHub, "7"), now + chrono::Duration::hours(1), now)
            .unwrap();

        assert!(!created);
        assert_eq!(identity.display_name.as_deref(), Some("Seven"));
        assert_eq!(identity.last_verified_at, now);
    }

    #[test]
    fn events_are_processed_once() {
        let store = InMemoryIdentityStore::new();
        let event = EventId::new();
        assert!(store.mark_event_processed(event).unwrap());
        assert!(!store.mark_event_processed(event).unwrap());
    }
}
