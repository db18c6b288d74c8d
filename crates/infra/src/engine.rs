//! Composition root: wires stores, plugins, resolver, matcher and the
//! dispatcher into one running engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{info, warn};

use drowl_core::{Job, JobId, JsonObject, NewJob};
use drowl_events::{Event, EventBus, InMemoryEventBus, Subscription};
use drowl_identity::{IdentityResolver, IdentityStore, InMemoryIdentityStore, ResolverConfig};
use drowl_keywords::{InMemoryKeywordStore, KeywordMatcher, KeywordStore};
use drowl_plugins::{
    ManifestDocument, Plugin, PluginRegistry, PluginRuntime, PluginServices, RegistryError,
    StorageError,
};

use crate::config::{ConfigError, EngineConfig};
use crate::event_store::{EventStore, InMemoryEventStore, PublishingEventStore};
use crate::jobs::{
    Dispatcher, DispatcherConfig, IdentityResolutionHandler, InMemoryJobStore, JobHandler, JobQueue,
    JobStoreError, KeywordExtractionHandler, PluginJobHandler, SubmitError,
};
use crate::kv::build_kv_store;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Jobs(#[from] JobStoreError),
}

/// Everything a worker process runs.
pub struct Engine {
    config: EngineConfig,
    queue: JobQueue,
    events: Arc<dyn EventStore>,
    bus: Arc<InMemoryEventBus<Event>>,
    registry: Arc<PluginRegistry>,
    identities: Arc<dyn IdentityStore>,
    resolver: Arc<IdentityResolver>,
    keywords: Arc<dyn KeywordStore>,
    matcher: Arc<KeywordMatcher>,
    dispatcher: Dispatcher,
    started: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let storage = build_kv_store(&config)?;
        let queue =
            JobQueue::new(InMemoryJobStore::arc()).with_chain_limit(config.max_batches_per_chain);

        let bus = Arc::new(InMemoryEventBus::<Event>::new());
        let events: Arc<dyn EventStore> =
            Arc::new(PublishingEventStore::new(InMemoryEventStore::new(), bus.clone()));

        let registry = Arc::new(PluginRegistry::new(PluginServices {
            storage,
            enqueuer: Arc::new(queue.clone()),
        }));

        let identities: Arc<dyn IdentityStore> = InMemoryIdentityStore::arc();
        let resolver = Arc::new(IdentityResolver::new(
            identities.clone(),
            ResolverConfig {
                min_confidence: config.min_link_confidence,
                ..ResolverConfig::default()
            },
        ));

        let keywords: Arc<dyn KeywordStore> = InMemoryKeywordStore::arc();
        let matcher = Arc::new(KeywordMatcher::new());

        let handlers: Vec<Arc<dyn JobHandler>> = vec![
            Arc::new(PluginJobHandler::new(registry.clone())),
            Arc::new(IdentityResolutionHandler::new(resolver.clone(), events.clone())),
            Arc::new(KeywordExtractionHandler::new(
                matcher.clone(),
                keywords.clone(),
                events.clone(),
            )),
        ];
        let dispatcher = Dispatcher::new(
            queue.clone(),
            events.clone(),
            handlers,
            DispatcherConfig::from(&config),
        );

        Ok(Self {
            config,
            queue,
            events,
            bus,
            registry,
            identities,
            resolver,
            keywords,
            matcher,
            dispatcher,
            started: AtomicBool::new(false),
        })
    }

    pub fn from_env() -> Result<Self, EngineError> {
        Self::new(EngineConfig::from_env()?)
    }

    /// Register a plugin. Once the engine is running the plugin is
    /// initialised and started straight away.
    pub async fn register_plugin(
        &self,
        doc: ManifestDocument,
        plugin: Arc<dyn Plugin>,
        operator_config: &JsonObject,
    ) -> Result<Arc<PluginRuntime>, EngineError> {
        let runtime = self.registry.register(doc, plugin, operator_config)?;
        if self.started.load(Ordering::Acquire) {
            runtime.init().await.map_err(RegistryError::from)?;
            runtime.start().await.map_err(RegistryError::from)?;
        }
        Ok(runtime)
    }

    /// Initialise and start plugins, then the workers. Plugins that fail to
    /// come up are logged and stay unavailable.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        for (plugin_id, err) in self.registry.init_all().await {
            warn!(plugin_id = %plugin_id, error = %err, "plugin failed to initialise");
        }
        for (plugin_id, err) in self.registry.start_all().await {
            warn!(plugin_id = %plugin_id, error = %err, "plugin failed to start");
        }
        self.dispatcher.start().await;
        info!(
            plugins = self.registry.len(),
            workers = self.config.worker_count,
            "engine started"
        );
    }

    /// Stop claiming work, wait for in-flight jobs, then stop plugins.
    pub async fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.shutdown().await;
        self.registry.stop_all().await;
        info!("engine stopped");
    }

    pub fn submit(&self, job: NewJob) -> Result<Job, EngineError> {
        Ok(self.queue.submit(job)?)
    }

    pub async fn await_job(&self, id: JobId) -> Result<Job, EngineError> {
        Ok(self.queue.await_terminal(id).await?)
    }

    /// Receive every event stored from now on.
    pub fn subscribe_events(&self) -> Subscription<Event> {
        self.bus.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn identities(&self) -> &Arc<dyn IdentityStore> {
        &self.identities
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn keywords(&self) -> &Arc<dyn KeywordStore> {
        &self.keywords
    }

    pub fn matcher(&self) -> &Arc<KeywordMatcher> {
        &self.matcher
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
