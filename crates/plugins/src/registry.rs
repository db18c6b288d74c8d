//! Plugin registry: validated registration, lookup by capability, reload.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use semver::Version;
use thiserror::Error;
use tracing::{info, warn};

use drowl_core::JsonObject;

use crate::capability::Capability;
use crate::config::ResolvedConfig;
use crate::context::{JobEnqueuer, KeyValueStore, PluginContext};
use crate::manifest::{ManifestDocument, ManifestError};
use crate::plugin::Plugin;
use crate::runtime::{LifecycleState, PluginRuntime, RuntimeError};
use crate::PLATFORM_VERSION;

/// Host resources every plugin context is built from.
#[derive(Clone)]
pub struct PluginServices {
    pub storage: Arc<dyn KeyValueStore>,
    pub enqueuer: Arc<dyn JobEnqueuer>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("plugin `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("plugin `{0}` is not registered")]
    NotFound(String),
    #[error("plugin `{plugin_id}` depends on `{dependency}`, which is not available")]
    MissingDependency { plugin_id: String, dependency: String },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

struct Registration {
    /// Registration order; dependencies always sort before dependents.
    seq: u64,
    runtime: Arc<PluginRuntime>,
}

/// Registered plugins, keyed by manifest id.
///
/// Registration is all-or-nothing: a manifest that fails validation, or whose
/// required configuration cannot be resolved, leaves the registry untouched.
pub struct PluginRegistry {
    plugins: DashMap<String, Registration>,
    services: PluginServices,
    platform_version: Version,
    next_seq: AtomicU64,
}

impl PluginRegistry {
    pub fn new(services: PluginServices) -> Self {
        let platform_version = Version::parse(PLATFORM_VERSION).unwrap_or_else(|_| Version::new(0, 0, 0));
        Self::with_platform_version(services, platform_version)
    }

    pub fn with_platform_version(services: PluginServices, platform_version: Version) -> Self {
        Self {
            plugins: DashMap::new(),
            services,
            platform_version,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn platform_version(&self) -> &Version {
        &self.platform_version
    }

    fn prepare(
        &self,
        doc: ManifestDocument,
        plugin: Arc<dyn Plugin>,
        operator_config: &JsonObject,
    ) -> Result<PluginRuntime, RegistryError> {
        let mut report = doc.validate(&self.platform_version);
        let config = ResolvedConfig::resolve(&doc.config_schema, operator_config, &mut report);

        if !report.is_success() {
            return Err(ManifestError::Invalid { id: doc.id, report }.into());
        }
        for dependency in &doc.dependencies {
            if !self.plugins.contains_key(dependency) {
                return Err(RegistryError::MissingDependency {
                    plugin_id: doc.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        for issue in &report.warnings {
            warn!(plugin_id = %doc.id, field = %issue.field, "manifest warning: {}", issue.message);
        }

        let manifest = doc.into_manifest(&self.platform_version)?;
        let context = PluginContext::new(
            &manifest.id,
            config,
            self.services.storage.clone(),
            self.services.enqueuer.clone(),
        );
        Ok(PluginRuntime::new(manifest, plugin, context))
    }

    /// Validate and register a plugin. It stays unavailable until `init`.
    pub fn register(
        &self,
        doc: ManifestDocument,
        plugin: Arc<dyn Plugin>,
        operator_config: &JsonObject,
    ) -> Result<Arc<PluginRuntime>, RegistryError> {
        let runtime = Arc::new(self.prepare(doc, plugin, operator_config)?);
        let id = runtime.id().to_string();

        match self.plugins.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                slot.insert(Registration {
                    seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                    runtime: runtime.clone(),
                });
            }
        }

        info!(
            plugin_id = %id,
            version = %runtime.manifest().version,
            capabilities = ?runtime.manifest().capabilities,
            "plugin registered"
        );
        Ok(runtime)
    }

    /// Parse a `plugin.json` document and register it.
    pub fn register_json(
        &self,
        manifest_json: &str,
        plugin: Arc<dyn Plugin>,
        operator_config: &JsonObject,
    ) -> Result<Arc<PluginRuntime>, RegistryError> {
        let doc = ManifestDocument::from_json(manifest_json)?;
        self.register(doc, plugin, operator_config)
    }

    /// Replace a registered plugin.
    ///
    /// The new instance is validated and initialised (and started, if the old
    /// one was running) before the swap; on any failure the old instance keeps
    /// serving. The old instance is stopped after the swap.
    pub async fn reload(
        &self,
        doc: ManifestDocument,
        plugin: Arc<dyn Plugin>,
        operator_config: &JsonObject,
    ) -> Result<Arc<PluginRuntime>, RegistryError> {
        let id = doc.id.clone();
        let old = self.get(&id).ok_or_else(|| RegistryError::NotFound(id.clone()))?;

        let fresh = Arc::new(self.prepare(doc, plugin, operator_config)?);
        fresh.init().await?;
        if old.state() == LifecycleState::Running {
            if let Err(e) = fresh.start().await {
                if let Err(stop_err) = fresh.stop().await {
                    warn!(
                        plugin_id = %id,
                        error = %stop_err,
                        "replacement plugin failed to stop after a failed start"
                    );
                }
                return Err(e.into());
            }
        }

        let replaced = match self.plugins.get_mut(&id) {
            Some(mut entry) => Some(std::mem::replace(&mut entry.runtime, fresh.clone())),
            None => {
                self.plugins.insert(
                    id.clone(),
                    Registration {
                        seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                        runtime: fresh.clone(),
                    },
                );
                None
            }
        };

        if let Some(old) = replaced {
            if let Err(e) = old.stop().await {
                warn!(plugin_id = %id, error = %e, "previous plugin instance failed to stop");
            }
        }

        info!(plugin_id = %id, version = %fresh.manifest().version, "plugin reloaded");
        Ok(fresh)
    }

    /// Remove a plugin and stop it.
    pub async fn unregister(&self, id: &str) -> Result<(), RegistryError> {
        let (_, registration) = self
            .plugins
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        registration.runtime.stop().await?;
        info!(plugin_id = %id, "plugin unregistered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<PluginRuntime>> {
        self.plugins.get(id).map(|entry| entry.runtime.clone())
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// All plugins in registration order.
    pub fn all(&self) -> Vec<Arc<PluginRuntime>> {
        let mut entries: Vec<(u64, Arc<PluginRuntime>)> = self
            .plugins
            .iter()
            .map(|entry| (entry.seq, entry.runtime.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, runtime)| runtime).collect()
    }

    /// Available plugins declaring `capability`, ordered by id.
    pub fn available_for(&self, capability: Capability) -> Vec<Arc<PluginRuntime>> {
        let mut found: Vec<_> = self
            .plugins
            .iter()
            .filter(|entry| {
                entry.runtime.manifest().has_capability(capability) && entry.runtime.is_available()
            })
            .map(|entry| entry.runtime.clone())
            .collect();
        found.sort_by(|a, b| a.id().cmp(b.id()));
        found
    }

    pub fn has_available(&self, capability: Capability) -> bool {
        self.plugins.iter().any(|entry| {
            entry.runtime.manifest().has_capability(capability) && entry.runtime.is_available()
        })
    }

    /// Initialise every registered plugin, dependencies first.
    ///
    /// A plugin whose dependency is unavailable is skipped. Failures are
    /// returned rather than aborting the rest.
    pub async fn init_all(&self) -> Vec<(String, RegistryError)> {
        let mut failures = Vec::new();
        for runtime in self.all() {
            if runtime.state() != LifecycleState::Registered {
                continue;
            }
            if let Some(dependency) = self.unavailable_dependency(&runtime) {
                warn!(plugin_id = %runtime.id(), dependency = %dependency, "skipping plugin init");
                failures.push((
                    runtime.id().to_string(),
                    RegistryError::MissingDependency {
                        plugin_id: runtime.id().to_string(),
                        dependency,
                    },
                ));
                continue;
            }
            if let Err(e) = runtime.init().await {
                failures.push((runtime.id().to_string(), e.into()));
            }
        }
        failures
    }

    /// Start every initialised plugin.
    pub async fn start_all(&self) -> Vec<(String, RegistryError)> {
        let mut failures = Vec::new();
        for runtime in self.all() {
            if runtime.state() != LifecycleState::Initialized {
                continue;
            }
            if let Err(e) = runtime.start().await {
                failures.push((runtime.id().to_string(), e.into()));
            }
        }
        failures
    }

    /// Stop every plugin, dependents first.
    pub async fn stop_all(&self) {
        for runtime in self.all().into_iter().rev() {
            if let Err(e) = runtime.stop().await {
                warn!(plugin_id = %runtime.id(), error = %e, "plugin failed to stop cleanly");
            }
        }
    }

    fn unavailable_dependency(&self, runtime: &PluginRuntime) -> Option<String> {
        runtime
            .manifest()
            .dependencies
            .iter()
            .find(|dep| !self.get(dep).is_some_and(|d| d.is_available()))
            .cloned()
    }
}

impl core::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.all())
            .field("platform_version", &self.platform_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use drowl_core::{JobId, NewJob};

    use crate::config::{ConfigField, ConfigFieldType};
    use crate::context::{EnqueueError, InMemoryKeyValueStore, PluginContext};
    use crate::plugin::PluginError;

    struct NoQueue;

    impl JobEnqueuer for NoQueue {
        fn enqueue(&self, _job: NewJob) -> Result<JobId, EnqueueError> {
            Err(EnqueueError("queue disabled in tests".into()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        async fn init(&self, ctx: &PluginContext) -> Result<(), PluginError> {
            self.log.lock().unwrap().push(format!("init {} {}", ctx.plugin_id(), self.label));
            Ok(())
        }

        async fn stop(&self, ctx: &PluginContext) -> Result<(), PluginError> {
            self.log.lock().unwrap().push(format!("stop {} {}", ctx.plugin_id(), self.label));
            Ok(())
        }
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::with_platform_version(
            PluginServices {
                storage: Arc::new(InMemoryKeyValueStore::new()),
                enqueuer: Arc::new(NoQueue),
            },
            Version::new(1, 0, 0),
        )
    }

    fn scheduled(id: &str) -> ManifestDocument {
        ManifestDocument::new(id, id, "1.0.0").with_capability(Capability::Scheduled)
    }

    #[test]
    fn missing_required_config_rejects_registration() {
        let registry = registry();
        let doc = scheduled("needs-token")
            .with_config_field(ConfigField::new("token", ConfigFieldType::Secret).required());

        let err = registry
            .register(doc, Arc::new(Recorder::default()), &JsonObject::new())
            .unwrap_err();

        assert!(matches!(err, RegistryError::Manifest(ManifestError::Invalid { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let registry = registry();
        registry
            .register(scheduled("a"), Arc::new(Recorder::default()), &JsonObject::new())
            .unwrap();

        let err = registry
            .register(scheduled("a"), Arc::new(Recorder::default()), &JsonObject::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered(id) if id == "a"));
    }

    #[test]
    fn dependencies_must_be_registered_first() {
        let registry = registry();
        let err = registry
            .register(
                scheduled("child").with_dependency("parent"),
                Arc::new(Recorder::default()),
                &JsonObject::new(),
            )
            .unwrap_err();

        assert!(matches!(err, RegistryError::MissingDependency { .. }));
    }

    #[test]
    fn operator_config_reaches_the_context() {
        let registry = registry();
        let doc = scheduled("cfg").with_config_field(
            ConfigField::new("page_size", ConfigFieldType::Number).with_default(json!(25)),
        );
        let supplied = json!({"page_size": 10}).as_object().cloned().unwrap();

        let runtime = registry
            .register(doc, Arc::new(Recorder::default()), &supplied)
            .unwrap();

        assert_eq!(runtime.context().config().get_i64("page_size"), Some(10));
    }

    #[tokio::test]
    async fn lookup_by_capability_only_returns_initialised_plugins() {
        let registry = registry();
        registry
            .register(scheduled("b"), Arc::new(Recorder::default()), &JsonObject::new())
            .unwrap();
        registry
            .register(scheduled("a"), Arc::new(Recorder::default()), &JsonObject::new())
            .unwrap();

        assert!(!registry.has_available(Capability::Scheduled));

        assert!(registry.init_all().await.is_empty());

        let ids: Vec<_> = registry
            .available_for(Capability::Scheduled)
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.available_for(Capability::Webhook).is_empty());
    }

    #[tokio::test]
    async fn reload_swaps_instances_and_stops_the_old_one() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(
                scheduled("swap"),
                Arc::new(Recorder { label: "v1", log: log.clone() }),
                &JsonObject::new(),
            )
            .unwrap();
        registry.init_all().await;

        let mut doc = scheduled("swap");
        doc.version = "1.1.0".into();
        let fresh = registry
            .reload(doc, Arc::new(Recorder { label: "v2", log: log.clone() }), &JsonObject::new())
            .await
            .unwrap();

        assert_eq!(fresh.manifest().version, Version::new(1, 1, 0));
        assert!(registry.get("swap").unwrap().is_available());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["init swap v1", "init swap v2", "stop swap v1"]
        );
    }

    /// Initialises, then refuses to start or stop.
    struct Unstartable;

    #[async_trait]
    impl Plugin for Unstartable {
        async fn start(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Err(PluginError::Transient("upstream unreachable".into()))
        }

        async fn stop(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Err(PluginError::Transient("still unreachable".into()))
        }
    }

    #[tokio::test]
    async fn failed_reload_keeps_the_running_instance() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(
                scheduled("swap"),
                Arc::new(Recorder { label: "v1", log: log.clone() }),
                &JsonObject::new(),
            )
            .unwrap();
        registry.init_all().await;
        registry.start_all().await;

        let mut doc = scheduled("swap");
        doc.version = "2.0.0".into();
        let err = registry
            .reload(doc, Arc::new(Unstartable), &JsonObject::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RegistryError::Runtime(RuntimeError::Hook { .. })));
        let current = registry.get("swap").unwrap();
        assert_eq!(current.manifest().version, Version::new(1, 0, 0));
        assert_eq!(current.state(), LifecycleState::Running);
        assert_eq!(*log.lock().unwrap(), vec!["init swap v1"]);
    }

    #[tokio::test]
    async fn stop_all_runs_in_reverse_registration_order() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry
            .register(scheduled("base"), Arc::new(Recorder { label: "", log: log.clone() }), &JsonObject::new())
            .unwrap();
        registry
            .register(
                scheduled("addon").with_dependency("base"),
                Arc::new(Recorder { label: "", log: log.clone() }),
                &JsonObject::new(),
            )
            .unwrap();

        registry.init_all().await;
        registry.stop_all().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["init base ", "init addon ", "stop addon ", "stop base "]
        );
    }
}
