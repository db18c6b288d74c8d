//! Confidence grading for identity links.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// How sure the system is that two platform accounts belong to one person.
///
/// Declaration order is ascending, so `Ord` gives
/// `Suggested < Low < Medium < High < Manual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Suggested,
    Low,
    Medium,
    High,
    Manual,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::Suggested => "suggested",
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Manual => "manual",
        }
    }

    /// Links at this level are active as soon as they are created.
    pub fn is_auto_active(&self) -> bool {
        matches!(self, ConfidenceLevel::High | ConfidenceLevel::Manual)
    }

    /// Score recorded when a heuristic supplies none of its own.
    pub fn default_score(&self) -> f64 {
        match self {
            ConfidenceLevel::Suggested => 0.2,
            ConfidenceLevel::Low => 0.4,
            ConfidenceLevel::Medium => 0.6,
            ConfidenceLevel::High => 0.9,
            ConfidenceLevel::Manual => 1.0,
        }
    }
}

impl core::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfidenceLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suggested" => Ok(ConfidenceLevel::Suggested),
            "low" => Ok(ConfidenceLevel::Low),
            "medium" => Ok(ConfidenceLevel::Medium),
            "high" => Ok(ConfidenceLevel::High),
            "manual" => Ok(ConfidenceLevel::Manual),
            other => Err(DomainError::validation(format!("unknown confidence level: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_trust() {
        assert!(ConfidenceLevel::Manual > ConfidenceLevel::High);
        assert!(ConfidenceLevel::High > ConfidenceLevel::Medium);
        assert!(ConfidenceLevel::Medium > ConfidenceLevel::Low);
        assert!(ConfidenceLevel::Low > ConfidenceLevel::Suggested);
    }

    #[test]
    fn only_high_and_manual_are_auto_active() {
        assert!(ConfidenceLevel::Manual.is_auto_active());
        assert!(ConfidenceLevel::High.is_auto_active());
        assert!(!ConfidenceLevel::Medium.is_auto_active());
        assert!(!ConfidenceLevel::Suggested.is_auto_active());
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("HIGH".parse::<ConfidenceLevel>().unwrap(), ConfidenceLevel::High);
        assert!("certain".parse::<ConfidenceLevel>().is_err());
    }
}
