use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use drowl_core::{DomainError, EventId, KeywordId};

use crate::keyword::{Keyword, NewKeyword};
use crate::matcher::KeywordMatch;

#[derive(Debug, Error)]
pub enum KeywordError {
    #[error("keyword not found: {0}")]
    NotFound(KeywordId),
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

pub trait KeywordStore: Send + Sync {
    fn add(&self, keyword: NewKeyword) -> Result<Keyword, KeywordError>;

    fn get(&self, id: KeywordId) -> Result<Option<Keyword>, KeywordError>;

    fn set_active(&self, id: KeywordId, active: bool) -> Result<Keyword, KeywordError>;

    fn active_keywords(&self) -> Result<Vec<Keyword>, KeywordError>;

    /// Store a match unless the (keyword, event) pair is already recorded.
    /// Returns whether it was stored.
    fn record_match(&self, m: KeywordMatch) -> Result<bool, KeywordError>;

    fn matches_for_event(&self, event_id: EventId) -> Result<Vec<KeywordMatch>, KeywordError>;

    fn matches_for_keyword(&self, keyword_id: KeywordId) -> Result<Vec<KeywordMatch>, KeywordError>;
}

#[derive(Debug, Default)]
pub struct InMemoryKeywordStore {
    keywords: DashMap<KeywordId, Keyword>,
    matches: DashMap<(KeywordId, EventId), KeywordMatch>,
}

impl InMemoryKeywordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn collect_matches(&self, pred: impl Fn(&(KeywordId, EventId)) -> bool) -> Vec<KeywordMatch> {
        let mut out: Vec<KeywordMatch> = self
            .matches
            .iter()
            .filter(|e| pred(e.key()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.matched_at.cmp(&b.matched_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

impl KeywordStore for InMemoryKeywordStore {
    fn add(&self, keyword: NewKeyword) -> Result<Keyword, KeywordError> {
        let keyword = keyword.into_keyword(Utc::now())?;
        self.keywords.insert(keyword.id, keyword.clone());
        tracing::info!(keyword_id = %keyword.id, term = %keyword.term, "keyword added");
        Ok(keyword)
    }

    fn get(&self, id: KeywordId) -> Result<Option<Keyword>, KeywordError> {
        Ok(self.keywords.get(&id).map(|k| k.value().clone()))
    }

    fn set_active(&self, id: KeywordId, active: bool) -> Result<Keyword, KeywordError> {
        let mut keyword = self.keywords.get_mut(&id).ok_or(KeywordError::NotFound(id))?;
        keyword.is_active = active;
        keyword.updated_at = Utc::now();
        Ok(keyword.clone())
    }

    fn active_keywords(&self) -> Result<Vec<Keyword>, KeywordError> {
        let mut out: Vec<Keyword> = self
            .keywords
            .iter()
            .filter(|k| k.is_active)
            .map(|k| k.value().clone())
            .collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    fn record_match(&self, m: KeywordMatch) -> Result<bool, KeywordError> {
        match self.matches.entry((m.keyword_id, m.event_id)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(m);
                Ok(true)
            }
        }
    }

    fn matches_for_event(&self, event_id: EventId) -> Result<Vec<KeywordMatch>, KeywordError> {
        Ok(self.collect_matches(|(_, e)| *e == event_id))
    }

    fn matches_for_keyword(&self, keyword_id: KeywordId) -> Result<Vec<KeywordMatch>, KeywordError> {
        Ok(self.collect_matches(|(k, _)| *k == keyword_id))
    }
}

impl<T: KeywordStore + ?Sized> KeywordStore for Arc<T> {
    fn add(&self, keyword: NewKeyword) -> Result<Keyword, KeywordError> {
        (**self).add(keyword)
    }

    fn get(&self, id: KeywordId) -> Result<Option<Keyword>, KeywordError> {
        (**self).get(id)
    }

    fn set_active(&self, id: KeywordId, active: bool) -> Result<Keyword, KeywordError> {
        (**self).set_active(id, active)
    }

    fn active_keywords(&self) -> Result<Vec<Keyword>, KeywordError> {
        (**self).active_keywords()
    }

    fn record_match(&self, m: KeywordMatch) -> Result<bool, KeywordError> {
        (**self).record_match(m)
    }

    fn matches_for_event(&self, event_id: EventId) -> Result<Vec<KeywordMatch>, KeywordError> {
        (**self).matches_for_event(event_id)
    }

    fn matches_for_keyword(&self, keyword_id: KeywordId) -> Result<Vec<KeywordMatch>, KeywordError> {
        (**self).matches_for_keyword(keyword_id)
    }
}
