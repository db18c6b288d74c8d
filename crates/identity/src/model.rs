//! Identity and identity-link records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drowl_core::{
    ConfidenceLevel, DomainError, DomainResult, IdentityId, IdentityLinkId, JsonObject, Platform,
};
use drowl_events::{EventActor, PlatformAccount};

/// Natural key of an identity: unique per (platform, platform_user_id).
pub type IdentityKey = PlatformAccount;

/// A platform account.
///
/// Never deleted; `is_active = false` retires it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub platform: Platform,
    pub platform_user_id: String,
    pub platform_username: Option<String>,
    pub display_name: Option<String>,
    pub profile_url: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub verified_email: Option<String>,
    pub discovered_at: DateTime<Utc>,
    /// Latest `occurred_at` of any event that observed this account.
    pub last_verified_at: DateTime<Utc>,
    pub is_active: bool,
    pub metadata: JsonObject,
}

impl Identity {
    /// First sighting of an account that only appeared as a reference
    /// (an OAuth-linked account, say); no profile data yet.
    pub fn discovered(key: &IdentityKey, occurred_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: IdentityId::new(),
            platform: key.platform,
            platform_user_id: key.platform_user_id.clone(),
            platform_username: None,
            display_name: None,
            profile_url: None,
            avatar_url: None,
            bio: None,
            verified_email: None,
            discovered_at: now,
            last_verified_at: occurred_at,
            is_active: true,
            metadata: JsonObject::new(),
        }
    }

    /// First sighting of an event actor.
    pub fn observed(actor: &EventActor, occurred_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let mut identity = Self::discovered(&actor.account(), occurred_at, now);
        identity.apply_profile(actor);
        identity
    }

    pub fn key(&self) -> IdentityKey {
        PlatformAccount::new(self.platform, self.platform_user_id.clone())
    }

    /// Fold in another observation.
    ///
    /// `last_verified_at` only moves forward, and profile fields are only
    /// taken from observations at least as recent as the newest one seen.
    pub fn refresh(&mut self, actor: &EventActor, occurred_at: DateTime<Utc>) {
        if occurred_at >= self.last_verified_at {
            self.last_verified_at = occurred_at;
            self.apply_profile(actor);
        }
    }

    fn apply_profile(&mut self, actor: &EventActor) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                *slot = Some(v.to_string());
            }
        }
        take(&mut self.platform_username, &actor.username);
        take(&mut self.display_name, &actor.display_name);
        take(&mut self.profile_url, &actor.profile_url);
        take(&mut self.avatar_url, &actor.avatar_url);
        take(&mut self.bio, &actor.bio);
        if let Some(email) = actor.verified_email.as_deref() {
            let email = normalize_email(email);
            if !email.is_empty() {
                self.verified_email = Some(email);
            }
        }
    }
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// How a link was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSource {
    UserManual,
    EmailVerified,
    OauthVerified,
    PluginHeuristic,
    MlInference,
    /// Same username plus similar profile text.
    ProfileSimilarity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkMetadata {
    pub plugin_id: Option<String>,
    pub reason: Option<String>,
    /// 0.0–1.0
    pub confidence_score: Option<f64>,
}

/// Undirected edge between two identities.
///
/// Immutable apart from `is_active`; a stronger claim about the same pair is
/// recorded as a new link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityLink {
    pub id: IdentityLinkId,
    /// The smaller of the two ids.
    pub identity_id_1: IdentityId,
    pub identity_id_2: IdentityId,
    pub confidence: ConfidenceLevel,
    pub link_source: LinkSource,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub is_active: bool,
    pub metadata: LinkMetadata,
}

impl IdentityLink {
    pub fn new(
        a: IdentityId,
        b: IdentityId,
        confidence: ConfidenceLevel,
        link_source: LinkSource,
        created_by: impl Into<String>,
        metadata: LinkMetadata,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if a == b {
            return Err(DomainError::validation("an identity cannot be linked to itself"));
        }
        if let Some(score) = metadata.confidence_score {
            if !(0.0..=1.0).contains(&score) {
                return Err(DomainError::validation(format!(
                    "confidence_score must be within 0..=1, got {score}"
                )));
            }
        }
        let (identity_id_1, identity_id_2) = ordered_pair(a, b);
        Ok(Self {
            id: IdentityLinkId::new(),
            identity_id_1,
            identity_id_2,
            confidence,
            link_source,
            created_at: now,
            created_by: created_by.into(),
            is_active: confidence.is_auto_active(),
            metadata,
        })
    }

    pub fn pair(&self) -> (IdentityId, IdentityId) {
        (self.identity_id_1, self.identity_id_2)
    }

    pub fn involves(&self, id: IdentityId) -> bool {
        self.identity_id_1 == id || self.identity_id_2 == id
    }

    /// The identity on the other end of the edge from `id`.
    pub fn other(&self, id: IdentityId) -> Option<IdentityId> {
        if self.identity_id_1 == id {
            Some(self.identity_id_2)
        } else if self.identity_id_2 == id {
            Some(self.identity_id_1)
        } else {
            None
        }
    }
}

pub(crate) fn ordered_pair(a: IdentityId, b: IdentityId) -> (IdentityId, IdentityId) {
    if a <= b { (a, b) } else { (b, a) }
}
