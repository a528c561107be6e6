//! The plugin host.
//!
//! [`PluginHost`] owns every live plugin instance, the service registry, and
//! the handles to the outside world (fetcher, sandbox transport, document
//! stores, window layer). It is cheap to clone; clones share one host.
//!
//! The host API is split across submodules by concern:
//!
//! - `lifecycle`: instantiate, connect, setup/resume, hot reload, unload
//! - `loader`: resolve references to descriptors, load dependencies first
//! - `library`: installed plugins in the workspace store, internal plugins
//! - `repository`: repository and workspace lists
//! - `engine`: remote engines for plugin types without a built-in backend
//! - `api`: functions plugins and embedders call (services, run, config)

mod api;
mod context;
mod engine;
mod events;
mod instance;
mod library;
mod lifecycle;
mod loader;
mod repository;
mod window;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

pub use api::PluginSummary;
pub use context::PluginContext;
pub use engine::{AUTO_ENGINE, Engine};
pub use events::HostEvent;
pub use instance::{LifecycleState, LogEntry, LogLevel, PluginInstance};
pub use library::{InstalledPlugin, RestoreFailure, RestoreReport};
pub use repository::RepositoryEntry;
pub use window::{HeadlessWindows, WindowLayer};

use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::plugin::descriptor::{PluginDescriptor, PluginType};
use crate::plugin::error::PluginError;
use crate::plugin::manifest::{ManifestCache, ManifestEntry};
use crate::plugin::reference::SourceResolver;
use crate::sandbox::SandboxTransport;
use crate::service::ServiceRegistry;
use crate::store::{DocumentStore, MemoryStoreFactory, StoreFactory};

/// Store holding host-wide documents (repository and workspace lists,
/// per-plugin settings).
pub const CONFIG_STORE: &str = "imjoy_config";

/// A plugin the host ships with, loaded by url.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalPlugin {
    pub uri: String,
    /// Load on restore.
    #[serde(default)]
    pub startup: bool,
}

/// Runtime knobs of the host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub workspace: String,
    /// Handshake timeout for worker-class plugins.
    pub worker_handshake: Duration,
    /// Handshake timeout for window-class plugins.
    pub window_handshake: Duration,
    pub default_repositories: Vec<String>,
    pub internal_plugins: BTreeMap<String, InternalPlugin>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            workspace: "default".to_string(),
            worker_handshake: Duration::from_secs(180),
            window_handshake: Duration::from_secs(10),
            default_repositories: vec![
                "imjoy-team/imjoy-plugins".to_string(),
                "imjoy-team/imjoy-demo-plugins".to_string(),
            ],
            internal_plugins: BTreeMap::new(),
        }
    }
}

pub(crate) struct HostInner {
    config: HostConfig,
    fetcher: Arc<dyn SourceFetcher>,
    resolver: SourceResolver,
    transport: Arc<dyn SandboxTransport>,
    stores: Arc<dyn StoreFactory>,
    windows: Arc<dyn WindowLayer>,
    registry: ServiceRegistry,
    /// Instances by id.
    plugins: DashMap<String, Arc<PluginInstance>>,
    /// Instances by name; the newest instance wins.
    plugin_names: DashMap<String, Arc<PluginInstance>>,
    engines: RwLock<Vec<Engine>>,
    orphans: Mutex<Vec<PluginDescriptor>>,
    workspace: RwLock<String>,
    repositories: RwLock<Vec<RepositoryEntry>>,
    workspaces: RwLock<Vec<String>>,
    /// Scope for bare plugin names: the selected repository's plugins.
    available: RwLock<Vec<ManifestEntry>>,
    events: broadcast::Sender<HostEvent>,
}

/// Builder for [`PluginHost`].
pub struct PluginHostBuilder {
    config: HostConfig,
    transport: Arc<dyn SandboxTransport>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    stores: Option<Arc<dyn StoreFactory>>,
    windows: Option<Arc<dyn WindowLayer>>,
}

impl PluginHostBuilder {
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn stores(mut self, stores: Arc<dyn StoreFactory>) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn windows(mut self, windows: Arc<dyn WindowLayer>) -> Self {
        self.windows = Some(windows);
        self
    }

    /// Defaults: HTTP fetcher, in-memory stores, headless windows.
    pub fn build(self) -> PluginHost {
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::default()));
        let (events, _) = broadcast::channel(events::EVENT_CAPACITY);
        let inner = HostInner {
            resolver: SourceResolver::new(ManifestCache::new(Arc::clone(&fetcher))),
            fetcher,
            transport: self.transport,
            stores: self
                .stores
                .unwrap_or_else(|| Arc::new(MemoryStoreFactory::new())),
            windows: self.windows.unwrap_or_else(|| Arc::new(HeadlessWindows)),
            registry: ServiceRegistry::new(),
            plugins: DashMap::new(),
            plugin_names: DashMap::new(),
            engines: RwLock::new(Vec::new()),
            orphans: Mutex::new(Vec::new()),
            workspace: RwLock::new(self.config.workspace.clone()),
            repositories: RwLock::new(Vec::new()),
            workspaces: RwLock::new(Vec::new()),
            available: RwLock::new(Vec::new()),
            events,
            config: self.config,
        };
        PluginHost {
            inner: Arc::new(inner),
        }
    }
}

/// Loads, supervises, and connects plugins.
#[derive(Clone)]
pub struct PluginHost {
    pub(crate) inner: Arc<HostInner>,
}

impl PluginHost {
    pub fn builder(transport: Arc<dyn SandboxTransport>) -> PluginHostBuilder {
        PluginHostBuilder {
            config: HostConfig::default(),
            transport,
            fetcher: None,
            stores: None,
            windows: None,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn resolver(&self) -> &SourceResolver {
        &self.inner.resolver
    }

    pub fn workspace(&self) -> String {
        self.inner.workspace.read().clone()
    }

    /// Reset plugin maps and the registry.
    pub fn init(&self) {
        self.inner.plugins.clear();
        self.inner.plugin_names.clear();
        self.inner.orphans.lock().clear();
        self.inner.registry.clear();
        info!(workspace = %self.workspace(), "plugin host initialized");
    }

    /// Unload every instance.
    pub async fn destroy(&self) {
        for instance in self.instances() {
            self.unload(&instance).await;
        }
        self.inner.registry.clear();
        info!("plugin host destroyed");
    }

    /// Every tracked instance, ordered by name.
    pub fn instances(&self) -> Vec<Arc<PluginInstance>> {
        let mut all: Vec<Arc<PluginInstance>> = self
            .inner
            .plugins
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        all
    }

    pub fn instance(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.inner
            .plugin_names
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn instance_by_id(&self, id: &str) -> Option<Arc<PluginInstance>> {
        self.inner
            .plugins
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn insert_instance(&self, instance: &Arc<PluginInstance>) {
        self.inner
            .plugins
            .insert(instance.id().to_string(), Arc::clone(instance));
        self.inner
            .plugin_names
            .insert(instance.name().to_string(), Arc::clone(instance));
    }

    /// Drop `instance` from the maps unless a newer instance took its place.
    pub(crate) fn remove_instance(&self, instance: &Arc<PluginInstance>) {
        self.inner
            .plugins
            .remove_if(instance.id(), |_, v| Arc::ptr_eq(v, instance));
        self.inner
            .plugin_names
            .remove_if(instance.name(), |_, v| Arc::ptr_eq(v, instance));
    }

    pub(crate) fn handshake_timeout(&self, plugin_type: &PluginType) -> Duration {
        if plugin_type.uses_window_handshake() {
            self.inner.config.window_handshake
        } else {
            self.inner.config.worker_handshake
        }
    }

    pub(crate) async fn open_store(&self, name: &str) -> Result<Arc<dyn DocumentStore>, PluginError> {
        self.inner
            .stores
            .open(name)
            .await
            .map_err(|e| PluginError::store(name, e))
    }

    pub(crate) async fn config_store(&self) -> Result<Arc<dyn DocumentStore>, PluginError> {
        self.open_store(CONFIG_STORE).await
    }

    /// Store of installed plugins for the current workspace.
    pub(crate) async fn workspace_store(&self) -> Result<Arc<dyn DocumentStore>, PluginError> {
        let name = format!("{}_workspace", self.workspace());
        self.open_store(&name).await
    }
}
