//! Plugin manifests: wire format, validation, and the validated form.

use std::collections::BTreeSet;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use drowl_core::{EventSource, JobType};

use crate::capability::Capability;
use crate::config::ConfigField;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginAuthor {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Manifest exactly as a plugin ships it (`plugin.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<PluginAuthor>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub supported_event_sources: Vec<String>,
    #[serde(default)]
    pub supported_job_types: Vec<String>,
    #[serde(default)]
    pub config_schema: Vec<ConfigField>,
    #[serde(default)]
    pub min_platform_version: Option<String>,
    /// Ids of plugins that must be registered first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl ManifestDocument {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: None,
            author: None,
            capabilities: Vec::new(),
            supported_event_sources: Vec::new(),
            supported_job_types: Vec::new(),
            config_schema: Vec::new(),
            min_platform_version: None,
            dependencies: Vec::new(),
            license: None,
            repository: None,
            homepage: None,
            keywords: Vec::new(),
        }
    }

    pub fn from_json(input: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(input).map_err(ManifestError::Parse)
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability.as_str().to_string());
        self
    }

    pub fn with_event_source(mut self, source: EventSource) -> Self {
        self.supported_event_sources.push(source.as_str().to_string());
        self
    }

    pub fn with_config_field(mut self, field: ConfigField) -> Self {
        self.config_schema.push(field);
        self
    }

    pub fn with_dependency(mut self, plugin_id: impl Into<String>) -> Self {
        self.dependencies.push(plugin_id.into());
        self
    }

    /// Validate manifest fields. The returned report contains errors and warnings.
    pub fn validate(&self, platform_version: &Version) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.id.trim().is_empty() {
            report.push_error("id", "identifier is required");
        } else if !is_valid_id(&self.id) {
            report.push_error(
                "id",
                "identifier must contain only ASCII letters, digits, '.', '-', or '_'",
            );
        }

        if self.name.trim().is_empty() {
            report.push_error("name", "name is required");
        }

        if Version::parse(self.version.trim()).is_err() {
            report.push_error("version", "version must use semantic versioning (eg. 0.1.0)");
        }

        if self.capabilities.is_empty() {
            report.push_error("capabilities", "at least one capability must be declared");
        }
        let mut seen = BTreeSet::new();
        for raw in &self.capabilities {
            match raw.parse::<Capability>() {
                Ok(cap) if !seen.insert(cap) => {
                    report.push_warning("capabilities", format!("duplicate capability declared: {raw}"))
                }
                Ok(_) => {}
                Err(_) => report.push_error("capabilities", format!("unknown capability: {raw}")),
            }
        }

        for raw in &self.supported_event_sources {
            if raw.parse::<EventSource>().is_err() {
                report.push_error("supportedEventSources", format!("unknown event source: {raw}"));
            }
        }
        if seen.contains(&Capability::EventIngestion) && self.supported_event_sources.is_empty() {
            report.push_warning(
                "supportedEventSources",
                "event_ingestion plugin declares no event sources; any source will be accepted",
            );
        }

        for raw in &self.supported_job_types {
            if raw.parse::<JobType>().is_err() {
                report.push_error("supportedJobTypes", format!("unknown job type: {raw}"));
            }
        }

        let mut keys = BTreeSet::new();
        for field in &self.config_schema {
            let path = format!("configSchema.{}", field.key);
            if field.key.trim().is_empty() {
                report.push_error("configSchema", "config field key is required");
            } else if !keys.insert(field.key.as_str()) {
                report.push_error(path.clone(), "duplicate config field key".to_string());
            }
            if let Some(default) = &field.default_value {
                if let Err(reason) = field.check_value(default) {
                    report.push_error(path, format!("default value is invalid: {reason}"));
                }
            }
        }

        if let Some(min) = &self.min_platform_version {
            match Version::parse(min.trim()) {
                Ok(min) if &min > platform_version => report.push_error(
                    "minPlatformVersion",
                    format!("requires platform {min}, running {platform_version}"),
                ),
                Ok(_) => {}
                Err(_) => report.push_error(
                    "minPlatformVersion",
                    "minPlatformVersion must use semantic versioning",
                ),
            }
        }

        for dep in &self.dependencies {
            if dep == &self.id {
                report.push_error("dependencies", "a plugin cannot depend on itself");
            } else if !is_valid_id(dep) {
                report.push_error("dependencies", format!("invalid plugin id: {dep}"));
            }
        }

        report
    }

    /// Validate and convert into the typed manifest.
    pub fn into_manifest(self, platform_version: &Version) -> Result<PluginManifest, ManifestError> {
        let report = self.validate(platform_version);
        if !report.is_success() {
            return Err(ManifestError::Invalid {
                id: self.id,
                report,
            });
        }

        let version = Version::parse(self.version.trim()).map_err(|e| ManifestError::Invalid {
            id: self.id.clone(),
            report: ValidationReport::single("version", e.to_string()),
        })?;

        Ok(PluginManifest {
            version,
            name: self.name,
            description: self.description,
            author: self.author,
            capabilities: self.capabilities.iter().filter_map(|c| c.parse().ok()).collect(),
            supported_event_sources: self
                .supported_event_sources
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            supported_job_types: self
                .supported_job_types
                .iter()
                .filter_map(|t| t.parse().ok())
                .collect(),
            config_schema: self.config_schema,
            min_platform_version: self
                .min_platform_version
                .as_deref()
                .and_then(|v| Version::parse(v.trim()).ok()),
            dependencies: self.dependencies,
            license: self.license.or_else(|| Some("MIT".to_string())),
            repository: self.repository,
            homepage: self.homepage,
            keywords: self.keywords,
            id: self.id,
        })
    }
}

/// A manifest that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub description: Option<String>,
    pub author: Option<PluginAuthor>,
    pub capabilities: BTreeSet<Capability>,
    /// Empty means any source.
    pub supported_event_sources: BTreeSet<EventSource>,
    /// Empty means any job type routed by the declared capabilities.
    pub supported_job_types: BTreeSet<JobType>,
    pub config_schema: Vec<ConfigField>,
    pub min_platform_version: Option<Version>,
    pub dependencies: Vec<String>,
    pub license: Option<String>,
    pub repository: Option<String>,
    pub homepage: Option<String>,
    pub keywords: Vec<String>,
}

impl PluginManifest {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn supports_source(&self, source: EventSource) -> bool {
        self.supported_event_sources.is_empty() || self.supported_event_sources.contains(&source)
    }

    pub fn supports_job_type(&self, job_type: JobType) -> bool {
        self.supported_job_types.is_empty() || self.supported_job_types.contains(&job_type)
    }
}

/// Report emitted by [`ManifestDocument::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut report = Self::default();
        report.push_error(field, message);
        report
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(field, message));
    }

    pub fn push_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationIssue::new(field, message));
    }

    /// Errors joined into one line, for error messages.
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(|issue| format!("{}: {}", issue.field, issue.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Individual validation issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to parse manifest as JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("manifest `{id}` failed validation: {}", .report.summary())]
    Invalid { id: String, report: ValidationReport },
}

fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFieldType;
    use serde_json::json;

    fn platform() -> Version {
        Version::new(1, 0, 0)
    }

    const GITHUB_MANIFEST: &str = r#"{
        "id": "drowl.github",
        "name": "GitHub",
        "version": "1.2.0",
        "capabilities": ["event_ingestion", "webhook"],
        "supportedEventSources": ["github"],
        "configSchema": [
            {"key": "token", "label": "Token", "type": "secret", "required": true},
            {"key": "pageSize", "type": "number", "defaultValue": 50}
        ],
        "minPlatformVersion": "0.1.0"
    }"#;

    #[test]
    fn manifest_parses_and_validates() {
        let doc = ManifestDocument::from_json(GITHUB_MANIFEST).unwrap();
        let report = doc.validate(&platform());
        assert!(report.is_success(), "{report:?}");

        let manifest = doc.into_manifest(&platform()).unwrap();
        assert!(manifest.has_capability(Capability::Webhook));
        assert!(!manifest.has_capability(Capability::Scheduled));
        assert!(manifest.supports_source(EventSource::GitHub));
        assert!(!manifest.supports_source(EventSource::X));
        assert_eq!(manifest.license.as_deref(), Some("MIT"));
    }

    #[test]
    fn unknown_capability_rejects_manifest() {
        let mut doc = ManifestDocument::new("demo", "Demo", "0.1.0")
            .with_capability(Capability::Analytics);
        doc.capabilities.push("mind_reading".into());

        let err = doc.into_manifest(&platform()).unwrap_err();
        match err {
            ManifestError::Invalid { id, report } => {
                assert_eq!(id, "demo");
                assert_eq!(report.errors.len(), 1);
                assert_eq!(report.errors[0].field, "capabilities");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn manifest_detects_invalid_id_and_version() {
        let doc = ManifestDocument::new("bad id!", "Demo", "one")
            .with_capability(Capability::Scheduled);
        let report = doc.validate(&platform());

        let fields: Vec<_> = report.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["id", "version"]);
    }

    #[test]
    fn newer_platform_requirement_is_rejected() {
        let mut doc = ManifestDocument::new("future", "Future", "0.1.0")
            .with_capability(Capability::Scheduled);
        doc.min_platform_version = Some("2.0.0".into());

        let report = doc.validate(&platform());
        assert_eq!(report.errors[0].field, "minPlatformVersion");
    }

    #[test]
    fn duplicate_config_keys_and_bad_defaults_are_errors() {
        let doc = ManifestDocument::new("dupe", "Dupe", "0.1.0")
            .with_capability(Capability::Scheduled)
            .with_config_field(ConfigField::new("limit", ConfigFieldType::Number))
            .with_config_field(ConfigField::new("limit", ConfigFieldType::Number))
            .with_config_field(ConfigField::new("url", ConfigFieldType::Url).with_default(json!("ftp://x")));

        let report = doc.validate(&platform());
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn duplicate_capability_only_warns() {
        let doc = ManifestDocument::new("twice", "Twice", "0.1.0")
            .with_capability(Capability::Scheduled)
            .with_capability(Capability::Scheduled);

        let report = doc.validate(&platform());
        assert!(report.is_success());
        assert_eq!(report.warnings.len(), 1);
    }
}
