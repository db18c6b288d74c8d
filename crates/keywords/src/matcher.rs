//! Content matching for keywords.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use drowl_core::{EventId, KeywordId, KeywordMatchId};
use drowl_events::Event;

use crate::keyword::{Keyword, MatchStrategy};

/// One keyword found in one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordMatch {
    pub id: KeywordMatchId,
    pub keyword_id: KeywordId,
    pub event_id: EventId,
    /// The term or synonym (pattern, for regex keywords) that matched.
    pub matched_term: String,
    pub via_synonym: bool,
    pub strategy: MatchStrategy,
    pub matched_at: DateTime<Utc>,
}

/// A keyword that could not be evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFailure {
    pub keyword_id: KeywordId,
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchReport {
    pub matches: Vec<KeywordMatch>,
    pub failures: Vec<MatchFailure>,
}

/// Matches keyword sets against event content.
///
/// Compiled patterns (and compile errors) are cached by pattern text, so a
/// keyword's regexes are built once no matter how many events it sees.
#[derive(Debug, Default)]
pub struct KeywordMatcher {
    regexes: DashMap<String, Result<Regex, String>>,
}

impl KeywordMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_patterns(&self) -> usize {
        self.regexes.len()
    }

    /// Evaluate every active keyword against the event's content, highest
    /// priority first. Invalid patterns fail only their own keyword.
    pub fn match_event(&self, keywords: &[Keyword], event: &Event) -> MatchReport {
        let mut report = MatchReport::default();
        let Some(content) = event.content.as_deref().filter(|c| !c.trim().is_empty()) else {
            return report;
        };

        let mut ordered: Vec<&Keyword> = keywords.iter().filter(|k| k.is_active).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

        let now = Utc::now();
        for keyword in ordered {
            match self.match_keyword(keyword, content) {
                Ok(Some((matched_term, via_synonym))) => {
                    debug!(keyword_id = %keyword.id, event_id = %event.id, term = %matched_term, "keyword matched");
                    report.matches.push(KeywordMatch {
                        id: KeywordMatchId::new(),
                        keyword_id: keyword.id,
                        event_id: event.id,
                        matched_term,
                        via_synonym,
                        strategy: keyword.match_strategy,
                        matched_at: now,
                    });
                }
                Ok(None) => {}
                Err(failure) => {
                    warn!(
                        keyword_id = %keyword.id,
                        pattern = %failure.pattern,
                        reason = %failure.reason,
                        "keyword pattern failed to compile"
                    );
                    report.failures.push(failure);
                }
            }
        }
        report
    }

    /// The first of term/synonyms that matches, and whether it was a synonym.
    pub fn match_keyword(&self, keyword: &Keyword, content: &str) -> Result<Option<(String, bool)>, MatchFailure> {
        if keyword.match_strategy == MatchStrategy::Regex {
            let Some(pattern) = keyword.regex_pattern.as_deref() else {
                return Err(MatchFailure {
                    keyword_id: keyword.id,
                    pattern: String::new(),
                    reason: "regex keyword without regex_pattern".to_string(),
                });
            };
            // Every pattern must compile, even once an earlier one matched.
            let mut found = None;
            let candidates = std::iter::once((pattern, false))
                .chain(keyword.synonyms.iter().map(|s| (s.as_str(), true)));
            for (candidate, via_synonym) in candidates {
                let re = self.compile(candidate).map_err(|reason| MatchFailure {
                    keyword_id: keyword.id,
                    pattern: candidate.to_string(),
                    reason,
                })?;
                if found.is_none() && re.is_match(content) {
                    found = Some((candidate.to_string(), via_synonym));
                }
            }
            return Ok(found);
        }

        let content = content.to_lowercase();
        let candidates = std::iter::once((keyword.term.as_str(), false))
            .chain(keyword.synonyms.iter().map(|s| (s.as_str(), true)));
        for (candidate, via_synonym) in candidates {
            if text_matches(keyword.match_strategy, &candidate.to_lowercase(), &content) {
                return Ok(Some((candidate.to_string(), via_synonym)));
            }
        }
        Ok(None)
    }

    /// Case-insensitive by default; inline flags in the pattern win.
    fn compile(&self, pattern: &str) -> Result<Regex, String> {
        if let Some(cached) = self.regexes.get(pattern) {
            return cached.value().clone();
        }
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| e.to_string());
        self.regexes.insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

/// Both arguments already lowercased.
fn text_matches(strategy: MatchStrategy, needle: &str, haystack: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    match strategy {
        MatchStrategy::Exact => haystack.trim() == needle,
        MatchStrategy::Substring => haystack.contains(needle),
        MatchStrategy::WordBoundary => haystack.match_indices(needle).any(|(start, _)| {
            let end = start + needle.len();
            let before = haystack[..start].chars().next_back();
            let after = haystack[end..].chars().next();
            !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
        }),
        // Regex keywords never reach plain-text matching.
        MatchStrategy::Regex => false,
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}
