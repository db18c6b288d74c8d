use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use drowl_core::{DomainError, DomainResult, KeywordId};

pub const DEFAULT_KEYWORD_PRIORITY: u8 = 5;
pub const MAX_KEYWORD_PRIORITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordCategory {
    Product,
    Technology,
    Topic,
    Competitor,
    Event,
    Person,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Whole (trimmed) content equals the term.
    Exact,
    /// Term occurs delimited by non-word characters.
    #[default]
    WordBoundary,
    Substring,
    /// `regex_pattern` and every synonym are patterns. Matching is
    /// case-insensitive unless the pattern turns it off with `(?-i)`.
    Regex,
}

impl MatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::WordBoundary => "word_boundary",
            MatchStrategy::Substring => "substring",
            MatchStrategy::Regex => "regex",
        }
    }
}

impl core::fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordMetadata {
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub reference_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub id: KeywordId,
    pub term: String,
    pub category: KeywordCategory,
    pub match_strategy: MatchStrategy,
    pub regex_pattern: Option<String>,
    pub synonyms: Vec<String>,
    pub priority: u8,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub metadata: KeywordMetadata,
}

/// Keyword submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewKeyword {
    pub term: String,
    pub category: KeywordCategory,
    #[serde(default)]
    pub match_strategy: MatchStrategy,
    #[serde(default)]
    pub regex_pattern: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub metadata: KeywordMetadata,
}

impl NewKeyword {
    pub fn new(term: impl Into<String>, category: KeywordCategory) -> Self {
        Self {
            term: term.into(),
            category,
            match_strategy: MatchStrategy::default(),
            regex_pattern: None,
            synonyms: Vec::new(),
            priority: None,
            created_by: None,
            metadata: KeywordMetadata::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: MatchStrategy) -> Self {
        self.match_strategy = strategy;
        self
    }

    pub fn with_regex(mut self, pattern: impl Into<String>) -> Self {
        self.match_strategy = MatchStrategy::Regex;
        self.regex_pattern = Some(pattern.into());
        self
    }

    pub fn with_synonym(mut self, synonym: impl Into<String>) -> Self {
        self.synonyms.push(synonym.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = Some(who.into());
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.term.trim().is_empty() {
            return Err(DomainError::validation("keyword term must not be empty"));
        }
        if let Some(p) = self.priority {
            if p > MAX_KEYWORD_PRIORITY {
                return Err(DomainError::validation(format!(
                    "keyword priority must be within 0..={MAX_KEYWORD_PRIORITY}, got {p}"
                )));
            }
        }
        let has_pattern = self
            .regex_pattern
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());
        match (self.match_strategy, has_pattern) {
            (MatchStrategy::Regex, false) => {
                Err(DomainError::validation("regex strategy requires regex_pattern"))
            }
            (strategy, true) if strategy != MatchStrategy::Regex => Err(DomainError::validation(
                format!("regex_pattern is only allowed with the regex strategy, not {strategy}"),
            )),
            _ => Ok(()),
        }
    }

    pub fn into_keyword(self, now: DateTime<Utc>) -> DomainResult<Keyword> {
        self.validate()?;
        Ok(Keyword {
            id: KeywordId::new(),
            term: self.term.trim().to_string(),
            category: self.category,
            match_strategy: self.match_strategy,
            regex_pattern: self.regex_pattern,
            synonyms: self
                .synonyms
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            priority: self.priority.unwrap_or(DEFAULT_KEYWORD_PRIORITY),
            is_active: true,
            created_at: now,
            updated_at: now,
            created_by: self.created_by,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_terms_are_rejected() {
        assert!(NewKeyword::new("  ", KeywordCategory::Topic).validate().is_err());
    }

    #[test]
    fn priority_is_bounded() {
        let kw = NewKeyword::new("rust", KeywordCategory::Technology).with_priority(11);
        assert!(kw.validate().is_err());
    }

    #[test]
    fn regex_pattern_iff_regex_strategy() {
        let missing = NewKeyword::new("rust", KeywordCategory::Technology).with_strategy(MatchStrategy::Regex);
        assert!(missing.validate().is_err());

        let mut stray = NewKeyword::new("rust", KeywordCategory::Technology);
        stray.regex_pattern = Some("ru.t".into());
        assert!(stray.validate().is_err());

        let ok = NewKeyword::new("rust", KeywordCategory::Technology).with_regex(r"\brust(lang)?\b");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn into_keyword_applies_defaults() {
        let kw = NewKeyword::new(" drowl ", KeywordCategory::Product)
            .with_synonym(" ")
            .with_synonym("drowl.io")
            .into_keyword(Utc::now())
            .unwrap();

        assert_eq!(kw.term, "drowl");
        assert_eq!(kw.synonyms, vec!["drowl.io".to_string()]);
        assert_eq!(kw.priority, DEFAULT_KEYWORD_PRIORITY);
        assert_eq!(kw.match_strategy, MatchStrategy::WordBoundary);
        assert!(kw.is_active);
    }
}
