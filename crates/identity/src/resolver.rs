//! Event-driven identity resolution.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use drowl_core::{ConfidenceLevel, EventId, IdentityId, IdentityLinkId};
use drowl_events::{Event, EventActor};

use crate::model::{Identity, IdentityLink, LinkMetadata, LinkSource};
use crate::similarity::{profile_score, ProfileView};
use crate::store::{IdentityStore, IdentityStoreError};

/// Strongest confidence a plugin hint can produce.
const HINT_CEILING: ConfidenceLevel = ConfidenceLevel::Medium;

const RESOLVER_ACTOR: &str = "identity-resolver";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Candidates below this confidence are discarded.
    pub min_confidence: ConfidenceLevel,
    /// Minimum profile score for a similarity candidate.
    pub similarity_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_confidence: ConfidenceLevel::Low,
            similarity_threshold: 0.5,
        }
    }
}

/// Outcome of one resolution pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub event_id: EventId,
    /// The actor's identity; `None` for actor-less events and repeats.
    pub identity: Option<Identity>,
    pub created_identity: bool,
    /// Links created by this pass.
    pub links: Vec<IdentityLink>,
    /// The event had been resolved before; nothing was changed.
    pub already_processed: bool,
}

impl Resolution {
    fn skipped(event_id: EventId) -> Self {
        Self {
            event_id,
            identity: None,
            created_identity: false,
            links: Vec::new(),
            already_processed: true,
        }
    }
}

struct Candidate {
    counterpart: IdentityId,
    confidence: ConfidenceLevel,
    source: LinkSource,
    metadata: LinkMetadata,
}

pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    config: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve the actor of one event. Repeats of an event id are no-ops.
    pub fn resolve(&self, event: &Event) -> Result<Resolution, IdentityStoreError> {
        if !self.store.mark_event_processed(event.id)? {
            debug!(event_id = %event.id, "event already resolved");
            return Ok(Resolution::skipped(event.id));
        }

        let Some(actor) = &event.actor else {
            return Ok(Resolution {
                already_processed: false,
                ..Resolution::skipped(event.id)
            });
        };

        let now = Utc::now();
        let (identity, created) = self.store.observe(actor, event.occurred_at, now)?;
        if created {
            info!(
                identity_id = %identity.id,
                platform = %identity.platform,
                event_id = %event.id,
                "identity discovered"
            );
        }

        let plugin_id = Some(event.metadata.plugin_id.clone());
        let candidates = self.candidates(&identity, actor, event, plugin_id, now)?;

        let mut links = Vec::new();
        for candidate in candidates {
            if candidate.confidence < self.config.min_confidence {
                debug!(
                    identity_id = %identity.id,
                    counterpart = %candidate.counterpart,
                    confidence = %candidate.confidence,
                    "candidate below confidence floor"
                );
                continue;
            }
            let link = IdentityLink::new(
                identity.id,
                candidate.counterpart,
                candidate.confidence,
                candidate.source,
                RESOLVER_ACTOR,
                candidate.metadata,
                now,
            )?;
            if let Some(link) = self.store.insert_link_if_stronger(link)? {
                info!(
                    link_id = %link.id,
                    identity_id_1 = %link.identity_id_1,
                    identity_id_2 = %link.identity_id_2,
                    confidence = %link.confidence,
                    active = link.is_active,
                    "identity link created"
                );
                links.push(link);
            }
        }

        Ok(Resolution {
            event_id: event.id,
            identity: Some(identity),
            created_identity: created,
            links,
            already_processed: false,
        })
    }

    /// Heuristics in precedence order; the first one to name a counterpart wins.
    fn candidates(
        &self,
        identity: &Identity,
        actor: &EventActor,
        event: &Event,
        plugin_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Candidate>, IdentityStoreError> {
        let mut seen = BTreeSet::from([identity.id]);
        let mut out = Vec::new();
        let mut push = |candidate: Candidate, out: &mut Vec<Candidate>| {
            if seen.insert(candidate.counterpart) {
                out.push(candidate);
            }
        };

        if let Some(email) = &identity.verified_email {
            for other in self.store.find_by_verified_email(email)? {
                push(
                    Candidate {
                        counterpart: other.id,
                        confidence: ConfidenceLevel::High,
                        source: LinkSource::EmailVerified,
                        metadata: LinkMetadata {
                            plugin_id: plugin_id.clone(),
                            reason: Some("shared verified email".to_string()),
                            confidence_score: None,
                        },
                    },
                    &mut out,
                );
            }
        }

        let own_key = identity.key();
        for account in actor.oauth_accounts.iter().filter(|a| **a != own_key) {
            let (other, created) = self.store.ensure(account, event.occurred_at, now)?;
            if created {
                debug!(identity_id = %other.id, platform = %other.platform, "identity discovered via oauth");
            }
            push(
                Candidate {
                    counterpart: other.id,
                    confidence: ConfidenceLevel::High,
                    source: LinkSource::OauthVerified,
                    metadata: LinkMetadata {
                        plugin_id: plugin_id.clone(),
                        reason: Some(format!("oauth verified {} account", account.platform)),
                        confidence_score: None,
                    },
                },
                &mut out,
            );
        }

        for hint in &event.link_hints {
            let Some(other) = self.store.find_by_key(&hint.account)? else {
                continue;
            };
            let score = match hint.score {
                Some(s) if !(0.0..=1.0).contains(&s) => {
                    warn!(event_id = %event.id, score = s, "ignoring out-of-range hint score");
                    None
                }
                s => s,
            };
            push(
                Candidate {
                    counterpart: other.id,
                    confidence: hint.confidence.min(HINT_CEILING),
                    source: LinkSource::PluginHeuristic,
                    metadata: LinkMetadata {
                        plugin_id: plugin_id.clone(),
                        reason: Some(hint.reason.clone()),
                        confidence_score: score,
                    },
                },
                &mut out,
            );
        }

        if let Some(username) = &identity.platform_username {
            let mine = view(identity);
            for other in self.store.find_by_username(username)? {
                let score = profile_score(&mine, &view(&other));
                if score < self.config.similarity_threshold {
                    continue;
                }
                push(
                    Candidate {
                        counterpart: other.id,
                        confidence: ConfidenceLevel::Low,
                        source: LinkSource::ProfileSimilarity,
                        metadata: LinkMetadata {
                            plugin_id: plugin_id.clone(),
                            reason: Some("matching username and profile".to_string()),
                            confidence_score: Some(score),
                        },
                    },
                    &mut out,
                );
            }
        }

        Ok(out)
    }

    /// Confirm a proposed link by recording a manual link for the same pair.
    pub fn confirm_link(
        &self,
        link_id: IdentityLinkId,
        confirmed_by: &str,
    ) -> Result<IdentityLink, IdentityStoreError> {
        let proposed = self
            .store
            .get_link(link_id)?
            .ok_or(IdentityStoreError::LinkNotFound(link_id))?;
        let (a, b) = proposed.pair();

        let existing = self
            .store
            .links_between(a, b)?
            .into_iter()
            .find(|l| l.confidence == ConfidenceLevel::Manual);
        if let Some(manual) = existing {
            return if manual.is_active {
                Ok(manual)
            } else {
                self.store.set_link_active(manual.id, true)
            };
        }

        let link = IdentityLink::new(
            a,
            b,
            ConfidenceLevel::Manual,
            LinkSource::UserManual,
            confirmed_by,
            LinkMetadata {
                plugin_id: proposed.metadata.plugin_id.clone(),
                reason: Some(format!("confirmed link {link_id}")),
                confidence_score: Some(1.0),
            },
            Utc::now(),
        )?;
        let link = self
            .store
            .insert_link_if_stronger(link)?
            .ok_or_else(|| IdentityStoreError::Storage(format!("manual link for {a}/{b} raced")))?;
        info!(link_id = %link.id, confirmed = %link_id, by = confirmed_by, "identity link confirmed");
        Ok(link)
    }

    pub fn set_link_active(&self, link_id: IdentityLinkId, active: bool) -> Result<IdentityLink, IdentityStoreError> {
        self.store.set_link_active(link_id, active)
    }

    pub fn deactivate_identity(&self, id: IdentityId) -> Result<Identity, IdentityStoreError> {
        let identity = self.store.set_identity_active(id, false)?;
        info!(identity_id = %id, "identity deactivated");
        Ok(identity)
    }

    /// Identities joined to `id` by an active link. No transitive closure.
    pub fn linked_identities(&self, id: IdentityId) -> Result<Vec<Identity>, IdentityStoreError> {
        let neighbours: BTreeSet<IdentityId> = self
            .store
            .links_for(id)?
            .into_iter()
            .filter(|l| l.is_active)
            .filter_map(|l| l.other(id))
            .collect();
        let mut out = Vec::with_capacity(neighbours.len());
        for other in neighbours {
            if let Some(identity) = self.store.get(other)? {
                out.push(identity);
            }
        }
        Ok(out)
    }
}

fn view(identity: &Identity) -> ProfileView<'_> {
    ProfileView {
        username: identity.platform_username.as_deref(),
        display_name: identity.display_name.as_deref(),
        bio: identity.bio.as_deref(),
    }
}
