//! Remote engines for plugin types without a built-in backend.
//!
//! A plugin's `engine_mode` picks its engine: `auto` takes the first
//! connected engine, anything else must name an engine (by name or url).
//! Plugins that could not be placed, or whose engine went away, are kept as
//! orphans and reloaded when a matching engine connects.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::PluginHost;
use crate::plugin::descriptor::PluginDescriptor;

pub const AUTO_ENGINE: &str = "auto";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engine {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub connected: bool,
}

impl Engine {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            connected: false,
        }
    }

    fn answers_to(&self, mode: &str) -> bool {
        self.name == mode || self.url == mode
    }
}

impl PluginHost {
    pub fn engines(&self) -> Vec<Engine> {
        self.inner.engines.read().clone()
    }

    /// Engine that should run a plugin with the given mode.
    pub fn select_engine(&self, engine_mode: &str) -> Option<Engine> {
        let engines = self.inner.engines.read();
        engines
            .iter()
            .filter(|e| e.connected)
            .find(|e| engine_mode == AUTO_ENGINE || e.answers_to(engine_mode))
            .cloned()
    }

    pub(crate) fn remember_orphan(&self, descriptor: PluginDescriptor) {
        let mut orphans = self.inner.orphans.lock();
        orphans.retain(|d| d.name != descriptor.name);
        orphans.push(descriptor);
    }

    /// Mark `engine` connected and reload every plugin waiting for it.
    ///
    /// Returns the names of the plugins that were reloaded.
    pub async fn engine_connected(&self, engine: Engine) -> Vec<String> {
        let url = engine.url.clone();
        {
            let mut engines = self.inner.engines.write();
            engines.retain(|e| e.url != url);
            engines.push(Engine {
                connected: true,
                ..engine.clone()
            });
        }
        info!(engine = %engine.name, url = %url, "engine connected");

        let mut pending: Vec<PluginDescriptor> = Vec::new();
        {
            let mut orphans = self.inner.orphans.lock();
            orphans.retain(|d| {
                let mode = d.engine_mode.as_deref().unwrap_or(AUTO_ENGINE);
                let matches = mode == AUTO_ENGINE || engine.answers_to(mode);
                if matches {
                    pending.push(d.clone());
                }
                !matches
            });
        }
        // live instances bound to this engine (or asking for it) reconnect too
        for instance in self.instances() {
            if instance.is_live() || pending.iter().any(|d| d.name == instance.name()) {
                continue;
            }
            let config = instance.config();
            let bound = instance.engine() == Some(url.as_str());
            let named = config
                .engine_mode
                .as_deref()
                .is_some_and(|mode| mode != AUTO_ENGINE && engine.answers_to(mode));
            if bound || named {
                pending.push(config);
            }
        }

        let mut reloaded = Vec::new();
        for descriptor in pending {
            let name = descriptor.name.clone();
            match self.reload_plugin(descriptor).await {
                Ok(_) => reloaded.push(name),
                Err(e) => warn!(plugin = %name, engine = %engine.name, error = %e, "failed to reload plugin on engine"),
            }
        }
        reloaded
    }

    /// Mark the engine at `url` disconnected and unload the plugins it ran.
    pub async fn engine_disconnected(&self, url: &str) -> Vec<String> {
        {
            let mut engines = self.inner.engines.write();
            for engine in engines.iter_mut().filter(|e| e.url == url) {
                engine.connected = false;
            }
        }
        info!(url = %url, "engine disconnected");

        let mut unloaded = Vec::new();
        for instance in self.instances() {
            if instance.is_live() || instance.engine() != Some(url) {
                continue;
            }
            self.remember_orphan(instance.config());
            self.unload(&instance).await;
            unloaded.push(instance.name().to_string());
        }
        unloaded
    }

    /// Forget an engine entirely.
    pub async fn remove_engine(&self, url: &str) -> Vec<String> {
        let unloaded = self.engine_disconnected(url).await;
        self.inner.engines.write().retain(|e| e.url != url);
        unloaded
    }
}
