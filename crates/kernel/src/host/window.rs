//! Window layer seam and proxy plugins.
//!
//! `window` and `rpc-window` plugins get no sandbox of their own: running
//! one opens a window built from its `defaults`. The host gives them a proxy
//! api whose `setup` does nothing and whose `run` talks to the window layer.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::plugin::descriptor::{PluginDescriptor, rand_id};
use crate::sandbox::{PluginApi, capability};

/// Renders plugin windows. Implemented by whatever UI embeds the host.
#[async_trait]
pub trait WindowLayer: Send + Sync {
    async fn create_window(&self, config: Value) -> anyhow::Result<Value>;

    async fn show_dialog(&self, config: Value) -> anyhow::Result<Value>;
}

/// Window layer without a UI: windows are logged and echoed back.
#[derive(Debug, Default, Clone)]
pub struct HeadlessWindows;

#[async_trait]
impl WindowLayer for HeadlessWindows {
    async fn create_window(&self, config: Value) -> anyhow::Result<Value> {
        debug!(window = %config["name"], "headless window created");
        Ok(config)
    }

    async fn show_dialog(&self, config: Value) -> anyhow::Result<Value> {
        debug!(window = %config["name"], "headless dialog shown");
        Ok(config)
    }
}

/// Window config for one run of a proxy plugin.
pub(crate) fn window_config(descriptor: &PluginDescriptor, my: &Value) -> Map<String, Value> {
    let mut config = match &descriptor.defaults {
        Some(Value::Object(defaults)) => defaults.clone(),
        _ => Map::new(),
    };
    config.insert("type".into(), json!(descriptor.name));
    config.insert("name".into(), my.get("name").cloned().unwrap_or_else(|| json!(descriptor.name)));
    config.insert("tag".into(), json!(descriptor.tag));
    config.insert("data".into(), my.get("data").cloned().unwrap_or(Value::Null));
    config.insert("config".into(), my.get("config").cloned().unwrap_or(Value::Null));
    config.insert("id".into(), json!(rand_id()));
    config.insert("window_id".into(), json!(format!("window_{}", rand_id())));
    config
}

fn wants_dialog(config: &Map<String, Value>, my: &Value) -> bool {
    my.get("as_dialog")
        .or_else(|| config.get("as_dialog"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Proxy api of a window plugin.
pub(crate) fn proxy_api(descriptor: &PluginDescriptor, windows: Arc<dyn WindowLayer>) -> PluginApi {
    let descriptor = Arc::new(descriptor.clone());
    let run = capability(move |args: Vec<Value>| {
        let descriptor = Arc::clone(&descriptor);
        let windows = Arc::clone(&windows);
        async move {
            let my = args.into_iter().next().unwrap_or(Value::Null);
            let mut config = window_config(&descriptor, &my);
            if wants_dialog(&config, &my) {
                if config.get("standalone").and_then(Value::as_bool).unwrap_or(false) {
                    config.remove("standalone");
                    config.insert("fullscreen".into(), json!(true));
                }
                windows.show_dialog(Value::Object(config)).await
            } else {
                windows.create_window(Value::Object(config)).await
            }
        }
    });
    PluginApi::new()
        .with("setup", capability(|_| async { Ok(Value::Null) }))
        .with("run", run)
}
