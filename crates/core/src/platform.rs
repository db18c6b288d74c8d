//! Platforms that host accounts and the sources events arrive from.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A platform on which an identity (account) lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "x")]
    X,
    #[serde(rename = "linkedin")]
    LinkedIn,
    #[serde(rename = "youtube")]
    YouTube,
    #[serde(rename = "dev.to")]
    DevTo,
    #[serde(rename = "zenn")]
    Zenn,
    #[serde(rename = "qiita")]
    Qiita,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "custom")]
    Custom,
}

impl Platform {
    pub const ALL: [Platform; 9] = [
        Platform::GitHub,
        Platform::X,
        Platform::LinkedIn,
        Platform::YouTube,
        Platform::DevTo,
        Platform::Zenn,
        Platform::Qiita,
        Platform::Email,
        Platform::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GitHub => "github",
            Platform::X => "x",
            Platform::LinkedIn => "linkedin",
            Platform::YouTube => "youtube",
            Platform::DevTo => "dev.to",
            Platform::Zenn => "zenn",
            Platform::Qiita => "qiita",
            Platform::Email => "email",
            Platform::Custom => "custom",
        }
    }
}

impl core::fmt::Display for Platform {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| DomainError::validation(format!("unknown platform: {s}")))
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventSource {
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "x")]
    X,
    #[serde(rename = "linkedin")]
    LinkedIn,
    #[serde(rename = "youtube")]
    YouTube,
    #[serde(rename = "dev.to")]
    DevTo,
    #[serde(rename = "zenn")]
    Zenn,
    #[serde(rename = "qiita")]
    Qiita,
    #[serde(rename = "webhook")]
    Webhook,
    #[serde(rename = "manual")]
    Manual,
}

impl EventSource {
    pub const ALL: [EventSource; 9] = [
        EventSource::GitHub,
        EventSource::X,
        EventSource::LinkedIn,
        EventSource::YouTube,
        EventSource::DevTo,
        EventSource::Zenn,
        EventSource::Qiita,
        EventSource::Webhook,
        EventSource::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::GitHub => "github",
            EventSource::X => "x",
            EventSource::LinkedIn => "linkedin",
            EventSource::YouTube => "youtube",
            EventSource::DevTo => "dev.to",
            EventSource::Zenn => "zenn",
            EventSource::Qiita => "qiita",
            EventSource::Webhook => "webhook",
            EventSource::Manual => "manual",
        }
    }

    /// The platform whose accounts produce events from this source, if any.
    pub fn platform(&self) -> Option<Platform> {
        match self {
            EventSource::GitHub => Some(Platform::GitHub),
            EventSource::X => Some(Platform::X),
            EventSource::LinkedIn => Some(Platform::LinkedIn),
            EventSource::YouTube => Some(Platform::YouTube),
            EventSource::DevTo => Some(Platform::DevTo),
            EventSource::Zenn => Some(Platform::Zenn),
            EventSource::Qiita => Some(Platform::Qiita),
            EventSource::Webhook | EventSource::Manual => None,
        }
    }
}

impl core::fmt::Display for EventSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        EventSource::ALL
            .into_iter()
            .find(|src| src.as_str() == wanted)
            .ok_or_else(|| DomainError::validation(format!("unknown event source: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_to_uses_dotted_wire_name() {
        let json = serde_json::to_string(&EventSource::DevTo).unwrap();
        assert_eq!(json, "\"dev.to\"");
        assert_eq!("dev.to".parse::<Platform>().unwrap(), Platform::DevTo);
    }

    #[test]
    fn webhook_source_has_no_platform() {
        assert_eq!(EventSource::Webhook.platform(), None);
        assert_eq!(EventSource::Qiita.platform(), Some(Platform::Qiita));
    }
}
