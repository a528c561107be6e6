//! The handle a plugin holds on the host.
//!
//! Passed to the sandbox in the handshake. It keeps only a weak reference so
//! a sandbox that outlives the host cannot keep it alive.

use std::sync::{Arc, Weak};

use serde_json::{Map, Value};

use super::{HostInner, PluginHost};
use crate::plugin::error::PluginError;
use crate::sandbox::PluginApi;
use crate::service::{ServiceConfig, ServiceRecord, ServiceRef};

#[derive(Clone)]
pub struct PluginContext {
    host: Weak<HostInner>,
    plugin_id: String,
    plugin_name: String,
}

impl PluginContext {
    pub(crate) fn new(host: &PluginHost, plugin_id: &str, plugin_name: &str) -> Self {
        Self {
            host: Arc::downgrade(&host.inner),
            plugin_id: plugin_id.to_string(),
            plugin_name: plugin_name.to_string(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    fn host(&self) -> Result<PluginHost, PluginError> {
        self.host
            .upgrade()
            .map(|inner| PluginHost { inner })
            .ok_or_else(|| PluginError::SandboxFailed {
                plugin: self.plugin_name.clone(),
                message: "the host has shut down".to_string(),
            })
    }

    pub async fn register_service(&self, config: ServiceConfig) -> Result<String, PluginError> {
        let host = self.host()?;
        let caller = host.instance_by_id(&self.plugin_id);
        host.register_service(caller.as_deref(), config).await
    }

    pub async fn unregister_service(&self, target: Option<ServiceRef>) -> Result<Vec<String>, PluginError> {
        let host = self.host()?;
        let caller = host.instance_by_id(&self.plugin_id);
        Ok(host.unregister_service(caller.as_deref(), target).await)
    }

    pub fn get_services(&self, filter: &Map<String, Value>) -> Result<Vec<ServiceRecord>, PluginError> {
        Ok(self.host()?.get_services(filter))
    }

    pub async fn get_plugin(&self, name: &str) -> Result<Arc<PluginApi>, PluginError> {
        self.host()?.get_plugin(name).await
    }

    pub async fn run_plugin(&self, name: &str, my: Value) -> Result<Value, PluginError> {
        self.host()?.run_plugin(name, my).await
    }

    pub async fn call_plugin(
        &self,
        name: &str,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, PluginError> {
        self.host()?.call_plugin(name, function, args).await
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<Value>, PluginError> {
        self.host()?.get_plugin_config(&self.plugin_name, key).await
    }

    pub async fn set_config(&self, key: &str, value: Value) -> Result<(), PluginError> {
        self.host()?
            .set_plugin_config(&self.plugin_name, key, value)
            .await
    }

    pub fn get_attachment(&self, name: &str) -> Result<Option<String>, PluginError> {
        Ok(self.host()?.get_attachment(&self.plugin_name, name))
    }

    pub fn show_message(&self, text: &str) -> Result<(), PluginError> {
        self.host()?
            .show_message(format!("{}: {text}", self.plugin_name));
        Ok(())
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("plugin_name", &self.plugin_name)
            .finish_non_exhaustive()
    }
}
