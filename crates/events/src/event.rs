//! Immutable event records.
//!
//! Plugins return [`EventDraft`]s; the runtime adapter stamps them with
//! ingestion time and producer metadata to make an [`Event`]. Raw payloads
//! are never inlined; `storage_key` points at them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drowl_core::{ConfidenceLevel, DomainError, DomainResult, EventId, EventSource, Platform};

/// An account on a specific platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformAccount {
    pub platform: Platform,
    pub platform_user_id: String,
}

impl PlatformAccount {
    pub fn new(platform: Platform, platform_user_id: impl Into<String>) -> Self {
        Self {
            platform,
            platform_user_id: platform_user_id.into(),
        }
    }
}

/// The account that produced an event, as observed by the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventActor {
    pub platform: Platform,
    pub platform_user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    /// Email address the platform itself has verified for this account.
    #[serde(default)]
    pub verified_email: Option<String>,
    /// Accounts on other platforms proven via OAuth.
    #[serde(default)]
    pub oauth_accounts: Vec<PlatformAccount>,
}

impl EventActor {
    pub fn new(platform: Platform, platform_user_id: impl Into<String>) -> Self {
        Self {
            platform,
            platform_user_id: platform_user_id.into(),
            username: None,
            display_name: None,
            avatar_url: None,
            profile_url: None,
            bio: None,
            verified_email: None,
            oauth_accounts: Vec::new(),
        }
    }

    pub fn account(&self) -> PlatformAccount {
        PlatformAccount::new(self.platform, self.platform_user_id.clone())
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_bio(mut self, bio: impl Into<String>) -> Self {
        self.bio = Some(bio.into());
        self
    }

    pub fn with_verified_email(mut self, email: impl Into<String>) -> Self {
        self.verified_email = Some(email.into());
        self
    }

    pub fn with_oauth_account(mut self, account: PlatformAccount) -> Self {
        self.oauth_accounts.push(account);
        self
    }
}

/// A plugin's claim that the actor and `account` are the same person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkHint {
    pub account: PlatformAccount,
    pub confidence: ConfidenceLevel,
    pub reason: String,
    /// 0.0–1.0
    #[serde(default)]
    pub score: Option<f64>,
}

/// Producer metadata stamped by the runtime adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub plugin_id: String,
    pub plugin_version: String,
    pub correlation_id: Option<String>,
}

/// An immutable ingested fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source: EventSource,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    /// Reference to the raw payload.
    pub storage_key: String,
    /// Text the keyword matcher runs against.
    pub content: Option<String>,
    pub actor: Option<EventActor>,
    pub link_hints: Vec<LinkHint>,
    pub metadata: EventMetadata,
}

impl Event {
    pub fn ingestion_latency(&self) -> chrono::Duration {
        self.ingested_at - self.occurred_at
    }
}

/// What a plugin hands back before the core stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Stable id chosen by the plugin; re-ingesting the same id is a no-op.
    #[serde(default)]
    pub id: Option<EventId>,
    pub source: EventSource,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub storage_key: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub actor: Option<EventActor>,
    #[serde(default)]
    pub link_hints: Vec<LinkHint>,
}

impl EventDraft {
    pub fn new(
        source: EventSource,
        event_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        storage_key: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            source,
            event_type: event_type.into(),
            occurred_at,
            storage_key: storage_key.into(),
            content: None,
            actor: None,
            link_hints: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_actor(mut self, actor: EventActor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_hint(mut self, hint: LinkHint) -> Self {
        self.link_hints.push(hint);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(DomainError::validation("event_type must not be empty"));
        }
        if self.storage_key.trim().is_empty() {
            return Err(DomainError::validation("storage_key must not be empty"));
        }
        if let Some(actor) = &self.actor {
            if actor.platform_user_id.trim().is_empty() {
                return Err(DomainError::validation("actor.platform_user_id must not be empty"));
            }
        }
        for hint in &self.link_hints {
            if hint.account.platform_user_id.trim().is_empty() {
                return Err(DomainError::validation("link hint account must have a platform_user_id"));
            }
            if let Some(score) = hint.score {
                if !(0.0..=1.0).contains(&score) {
                    return Err(DomainError::validation(format!(
                        "link hint score must be within 0..=1, got {score}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stamp the draft into an immutable event.
    pub fn into_event(self, metadata: EventMetadata, ingested_at: DateTime<Utc>) -> DomainResult<Event> {
        self.validate()?;
        Ok(Event {
            id: self.id.unwrap_or_default(),
            source: self.source,
            event_type: self.event_type,
            occurred_at: self.occurred_at,
            ingested_at,
            storage_key: self.storage_key,
            content: self.content,
            actor: self.actor,
            link_hints: self.link_hints,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> EventMetadata {
        EventMetadata {
            plugin_id: "github".into(),
            plugin_version: "1.0.0".into(),
            correlation_id: Some("corr-1".into()),
        }
    }

    #[test]
    fn stamping_keeps_plugin_supplied_id_and_sets_latency() {
        let id = EventId::new();
        let occurred = Utc::now() - chrono::Duration::seconds(30);
        let event = EventDraft::new(EventSource::GitHub, "push", occurred, "raw/1.json")
            .with_id(id)
            .into_event(metadata(), Utc::now())
            .unwrap();

        assert_eq!(event.id, id);
        assert!(event.ingestion_latency() >= chrono::Duration::seconds(30));
        assert_eq!(event.metadata.plugin_id, "github");
    }

    #[test]
    fn out_of_range_hint_score_is_rejected() {
        let draft = EventDraft::new(EventSource::X, "post", Utc::now(), "raw/2.json").with_hint(
            LinkHint {
                account: PlatformAccount::new(Platform::GitHub, "42"),
                confidence: ConfidenceLevel::Medium,
                reason: "same handle".into(),
                score: Some(1.5),
            },
        );

        assert!(matches!(draft.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn empty_storage_key_is_rejected() {
        let draft = EventDraft::new(EventSource::Manual, "note", Utc::now(), "  ");
        assert!(draft.into_event(metadata(), Utc::now()).is_err());
    }
}
