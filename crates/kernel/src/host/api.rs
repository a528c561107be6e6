//! Host API: what plugins (through their [`super::PluginContext`]) and
//! embedders call.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::PluginHost;
use super::engine::Engine;
use super::events::HostEvent;
use super::instance::{LifecycleState, PluginInstance};
use crate::plugin::descriptor::content_digest;
use crate::plugin::error::PluginError;
use crate::plugin::parser::ParseOverrides;
use crate::plugin::reference::PluginReference;
use crate::plugin::version::is_newer;
use crate::sandbox::PluginApi;
use crate::service::{Provider, ServiceConfig, ServiceRecord, ServiceRef};
use crate::store::{Document, get_optional, upsert};

/// What `get_plugins` reports per instance.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub tag: Option<String>,
    pub state: LifecycleState,
    pub engine: Option<String>,
}

fn provider_of(caller: Option<&PluginInstance>) -> Provider {
    caller.map_or_else(Provider::root, PluginInstance::provider)
}

fn config_doc_id(plugin: &str, key: &str) -> String {
    format!("config_{plugin}_{key}")
}

impl PluginHost {
    /// Register a service on behalf of `caller` (the host itself when
    /// `None`).
    ///
    /// An `engine` service also makes its url available as an engine.
    pub async fn register_service(
        &self,
        caller: Option<&PluginInstance>,
        config: ServiceConfig,
    ) -> Result<String, PluginError> {
        let provider = provider_of(caller);
        let is_op = config.is_operation();
        let engine = (config.service_type() == Some("engine"))
            .then(|| {
                let url = config.fields.get("url").and_then(Value::as_str)?;
                Some(Engine::new(config.name().unwrap_or(url), url))
            })
            .flatten();

        let id = self.inner.registry.register(&provider, config)?;
        if is_op {
            let key = if id == provider.name {
                id.clone()
            } else {
                format!("{}/{id}", provider.name)
            };
            self.emit(HostEvent::OpRegistered { key });
        }
        self.emit(HostEvent::ServiceRegistered {
            provider: provider.name.clone(),
            id: id.clone(),
        });
        debug!(provider = %provider.name, service = %id, "service registered");
        if let Some(engine) = engine {
            self.engine_connected(engine).await;
        }
        Ok(id)
    }

    /// Unregister services of `caller`. Without a target, all of them.
    pub async fn unregister_service(
        &self,
        caller: Option<&PluginInstance>,
        target: Option<ServiceRef>,
    ) -> Vec<String> {
        let provider = provider_of(caller);
        let engine_urls: Vec<String> = self
            .inner
            .registry
            .find(&Map::new())
            .into_iter()
            .filter(|r| r.provider == provider.name && r.service_type == "engine")
            .filter(|r| match &target {
                None => true,
                Some(ServiceRef::Service(id)) => r.id == *id,
                Some(ServiceRef::Operation(_)) => false,
            })
            .filter_map(|r| r.fields.get("url").and_then(Value::as_str).map(str::to_string))
            .collect();

        let removed = self.inner.registry.unregister(&provider, target);
        for id in &removed {
            self.emit(HostEvent::ServiceUnregistered {
                provider: provider.name.clone(),
                id: id.clone(),
            });
        }
        for url in engine_urls {
            self.engine_disconnected(&url).await;
        }
        removed
    }

    /// Deprecated alias of [`Self::register_service`].
    pub async fn register(
        &self,
        caller: Option<&PluginInstance>,
        config: ServiceConfig,
    ) -> Result<String, PluginError> {
        warn!("`register` is deprecated, use `register_service`");
        self.register_service(caller, config).await
    }

    /// Deprecated alias of [`Self::unregister_service`].
    pub async fn unregister(
        &self,
        caller: Option<&PluginInstance>,
        target: Option<ServiceRef>,
    ) -> Vec<String> {
        warn!("`unregister` is deprecated, use `unregister_service`");
        self.unregister_service(caller, target).await
    }

    pub fn get_services(&self, filter: &Map<String, Value>) -> Vec<ServiceRecord> {
        self.inner.registry.find(filter)
    }

    /// Api of a running plugin.
    ///
    /// Falls back to internal plugins, then to loading `reference` when it
    /// is a url or repository reference rather than a bare name.
    pub async fn get_plugin(&self, reference: &str) -> Result<Arc<PluginApi>, PluginError> {
        if let Some(instance) = self.instance(reference) {
            return Ok(Arc::clone(instance.api()));
        }
        if let Some(instance) = self.load_internal_plugin(reference).await? {
            return Ok(Arc::clone(instance.api()));
        }
        if !matches!(
            PluginReference::classify(reference)?,
            PluginReference::Bare { .. }
        ) && let Some(instance) = self.load_from_reference(reference, None).await?
        {
            return Ok(Arc::clone(instance.api()));
        }
        Err(PluginError::PluginNotFound {
            name: reference.to_string(),
        })
    }

    pub fn get_plugins(&self) -> Vec<PluginSummary> {
        self.instances()
            .iter()
            .map(|instance| {
                let config = instance.config();
                PluginSummary {
                    id: instance.id().to_string(),
                    name: instance.name().to_string(),
                    plugin_type: config.plugin_type.to_string(),
                    tag: config.tag,
                    state: instance.state(),
                    engine: instance.engine().map(str::to_string),
                }
            })
            .collect()
    }

    /// Call an exported function of a running plugin.
    pub async fn call_plugin(
        &self,
        name: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, PluginError> {
        let api = self.get_plugin(name).await?;
        let Some(callable) = api.get(function) else {
            return Err(PluginError::capability_missing(name, function));
        };
        callable
            .call(args)
            .await
            .map_err(|e| PluginError::call_failed(name, function, &e))
    }

    /// Run a plugin with `my` (`{data, config}`).
    pub async fn run_plugin(&self, name: &str, my: Value) -> Result<Value, PluginError> {
        self.call_plugin(name, "run", vec![my]).await
    }

    /// Per-plugin setting. `_field` names read the plugin's config field.
    pub async fn get_plugin_config(&self, plugin: &str, key: &str) -> Result<Option<Value>, PluginError> {
        if let Some(field) = key.strip_prefix('_') {
            return Ok(self
                .instance(plugin)
                .and_then(|instance| instance.config().readonly_field(field)));
        }
        let id = config_doc_id(plugin, key);
        let store = self.config_store().await?;
        let doc = get_optional(store.as_ref(), &id)
            .await
            .map_err(|e| PluginError::store(&id, e))?;
        Ok(doc.and_then(|d| d.field("value").cloned()))
    }

    pub async fn set_plugin_config(&self, plugin: &str, key: &str, value: Value) -> Result<(), PluginError> {
        if key.starts_with('_') {
            return Err(PluginError::ReadonlyConfigField {
                plugin: plugin.to_string(),
                field: key.to_string(),
            });
        }
        let id = config_doc_id(plugin, key);
        let mut body = Map::new();
        body.insert("value".into(), value);
        let store = self.config_store().await?;
        upsert(store.as_ref(), Document::new(&id, body))
            .await
            .map_err(|e| PluginError::store(&id, e))?;
        Ok(())
    }

    pub fn get_attachment(&self, plugin: &str, name: &str) -> Option<String> {
        self.instance(plugin)
            .and_then(|instance| instance.config().attachment(name).map(str::to_string))
    }

    /// Whether the plugin's origin serves a different source with a newer
    /// version (or a different source and no versions to compare).
    pub async fn check_plugin_update(&self, name: &str) -> Result<bool, PluginError> {
        let instance = self.instance(name).ok_or_else(|| PluginError::PluginNotFound {
            name: name.to_string(),
        })?;
        let current = instance.config();
        let Some(origin) = current.origin.clone() else {
            return Ok(false);
        };
        let overrides = ParseOverrides::default().with_tag(current.tag.clone());
        let scope = self.available_plugins();
        let (latest, _) = self.get_plugin_source(&origin, &scope, overrides).await?;
        if content_digest(&latest.code) == content_digest(&current.code) {
            return Ok(false);
        }
        let newer = match (&latest.version, &current.version) {
            (Some(latest), Some(current)) => is_newer(latest, current),
            _ => true,
        };
        if newer {
            info!(plugin = %name, version = ?latest.version, "plugin update available");
        }
        Ok(newer)
    }

    /// Names of running plugins with an update available. Plugins whose
    /// origin cannot be fetched are logged and left out.
    pub async fn check_updates(&self) -> Vec<String> {
        let mut updates = Vec::new();
        for instance in self.instances() {
            match self.check_plugin_update(instance.name()).await {
                Ok(true) => updates.push(instance.name().to_string()),
                Ok(false) => {}
                Err(e) => warn!(plugin = %instance.name(), error = %e, "update check failed"),
            }
        }
        if !updates.is_empty() {
            self.show_message(format!("Updates available for: {}", updates.join(", ")));
        }
        updates
    }

    /// Diagnostic snapshot of a running plugin.
    pub fn describe_plugin(&self, name: &str) -> Option<Value> {
        let instance = self.instance(name)?;
        Some(json!({
            "id": instance.id(),
            "name": instance.name(),
            "state": instance.state(),
            "initializing": instance.is_initializing(),
            "functions": instance.api().names(),
            "log_history": instance.log_history(),
        }))
    }
}
