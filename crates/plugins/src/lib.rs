//! Plugin extension contract.
//!
//! A plugin is a [`Plugin`] implementation plus a [`PluginManifest`] that
//! declares what it can do. The [`PluginRegistry`] validates manifests and
//! operator configuration at load time; each registered plugin is wrapped in
//! a [`PluginRuntime`] that owns its lifecycle and refuses operations the
//! manifest did not declare.

pub mod capability;
pub mod config;
pub mod context;
pub mod manifest;
pub mod plugin;
pub mod registry;
pub mod runtime;

pub use capability::Capability;
pub use config::{ConfigField, ConfigFieldType, FieldValidation, ResolvedConfig};
pub use context::{
    EnqueueError, InMemoryKeyValueStore, JobEnqueuer, KeyValueStore, PluginContext, PluginLogger,
    PluginQueue, PluginStorage, StorageError,
};
pub use manifest::{
    ManifestDocument, ManifestError, PluginAuthor, PluginManifest, ValidationIssue,
    ValidationReport,
};
pub use plugin::{IngestBatch, IngestParams, Plugin, PluginError, ScheduledTask, WebhookRequest};
pub use registry::{PluginRegistry, PluginServices, RegistryError};
pub use runtime::{IngestedBatch, LifecycleState, PluginRuntime, RuntimeError};

/// Version of the plugin host, checked against `min_platform_version`.
pub const PLATFORM_VERSION: &str = env!("CARGO_PKG_VERSION");
