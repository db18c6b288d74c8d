//! Capabilities a plugin can declare.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use drowl_core::{DomainError, JobType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    EventIngestion,
    IdentityResolution,
    KeywordExtraction,
    Analytics,
    Export,
    Webhook,
    Scheduled,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::EventIngestion,
        Capability::IdentityResolution,
        Capability::KeywordExtraction,
        Capability::Analytics,
        Capability::Export,
        Capability::Webhook,
        Capability::Scheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::EventIngestion => "event_ingestion",
            Capability::IdentityResolution => "identity_resolution",
            Capability::KeywordExtraction => "keyword_extraction",
            Capability::Analytics => "analytics",
            Capability::Export => "export",
            Capability::Webhook => "webhook",
            Capability::Scheduled => "scheduled",
        }
    }

    /// Capability a job of this type is routed (and rate limited) by.
    pub fn for_job_type(job_type: JobType) -> Capability {
        match job_type {
            JobType::EventIngestion => Capability::EventIngestion,
            JobType::IdentityResolution => Capability::IdentityResolution,
            JobType::KeywordExtraction => Capability::KeywordExtraction,
            JobType::Analytics | JobType::ReportGeneration => Capability::Analytics,
            JobType::DataExport => Capability::Export,
            JobType::Cleanup | JobType::Custom => Capability::Scheduled,
        }
    }
}

impl core::fmt::Display for Capability {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| DomainError::validation(format!("unknown capability: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_job_type_routes_to_a_capability() {
        for job_type in JobType::ALL {
            let cap = Capability::for_job_type(job_type);
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
        assert_eq!(Capability::for_job_type(JobType::DataExport), Capability::Export);
    }

    #[test]
    fn unknown_capability_is_rejected() {
        assert!("telepathy".parse::<Capability>().is_err());
    }
}
