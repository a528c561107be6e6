//! Live plugin instances and their lifecycle states.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::plugin::descriptor::{PluginDescriptor, PluginType};
use crate::sandbox::{PluginApi, SandboxHandle};
use crate::service::Provider;

/// Where an instance is in its lifecycle.
///
/// Resolution and parsing happen before an instance exists, so every
/// instance starts in `Instantiating`. `Failed` and `Terminated` are
/// terminal: nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Instantiating,
    Connecting,
    Resuming,
    SettingUp,
    Ready,
    Failed,
    Terminated,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Instantiating => "instantiating",
            Self::Connecting => "connecting",
            Self::Resuming => "resuming",
            Self::SettingUp => "setting_up",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Failed | Terminated)
                | (Instantiating, Connecting)
                // proxy plugins skip the handshake
                | (Instantiating, Ready)
                | (Connecting, Resuming | SettingUp | Ready)
                | (Resuming | SettingUp, Ready)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One entry of an instance's log history.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// A running (or connecting) plugin.
///
/// The `api` object is created once and kept for the life of the instance;
/// connection and hot reload swap its functions in place.
pub struct PluginInstance {
    id: String,
    name: String,
    config: RwLock<PluginDescriptor>,
    api: Arc<PluginApi>,
    handle: Mutex<Option<Arc<dyn SandboxHandle>>>,
    state: RwLock<LifecycleState>,
    /// Url of the engine running this instance.
    engine: Option<String>,
    /// Attached to an externally established session.
    live: bool,
    initializing: AtomicBool,
    unloaded: AtomicBool,
    terminated: AtomicBool,
    log_history: Mutex<Vec<LogEntry>>,
}

impl PluginInstance {
    pub(crate) fn new(descriptor: PluginDescriptor, engine: Option<String>, live: bool) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            config: RwLock::new(descriptor),
            api: Arc::new(PluginApi::new()),
            handle: Mutex::new(None),
            state: RwLock::new(LifecycleState::Instantiating),
            engine,
            live,
            initializing: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            log_history: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the config. Diverges from the loaded descriptor after a
    /// hot reload.
    pub fn config(&self) -> PluginDescriptor {
        self.config.read().clone()
    }

    pub fn plugin_type(&self) -> PluginType {
        self.config.read().plugin_type.clone()
    }

    pub fn api(&self) -> &Arc<PluginApi> {
        &self.api
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn engine(&self) -> Option<&str> {
        self.engine.as_deref()
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::SeqCst)
    }

    pub fn log_history(&self) -> Vec<LogEntry> {
        self.log_history.lock().clone()
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_history.lock().push(LogEntry {
            time: Utc::now(),
            level,
            message: message.into(),
        });
    }

    /// Move to `next` if the state machine allows it.
    pub(crate) fn transition(&self, next: LifecycleState) -> bool {
        let mut state = self.state.write();
        if state.can_transition_to(next) {
            debug!(plugin = %self.name, from = %*state, to = %next, "lifecycle transition");
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_initializing(&self, value: bool) {
        self.initializing.store(value, Ordering::SeqCst);
    }

    /// Returns false when the instance was already unloaded.
    pub(crate) fn mark_unloaded(&self) -> bool {
        !self.unloaded.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn set_handle(&self, handle: Arc<dyn SandboxHandle>) {
        *self.handle.lock() = Some(handle);
    }

    pub(crate) fn handle(&self) -> Option<Arc<dyn SandboxHandle>> {
        self.handle.lock().clone()
    }

    pub(crate) fn update_config(&self, update: impl FnOnce(&mut PluginDescriptor)) {
        update(&mut self.config.write());
    }

    /// Registry provider backed by this instance.
    pub(crate) fn provider(&self) -> Provider {
        let config = self.config.read();
        Provider::new(&self.id, &self.name)
            .with_api(Arc::clone(&self.api))
            .with_description(config.description.clone())
            .with_type(config.plugin_type.as_str())
    }

    /// Tear down the sandbox. Only the first call reaches the sandbox.
    pub async fn terminate(&self) -> anyhow::Result<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transition(LifecycleState::Terminated);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.terminate().await?;
        }
        Ok(())
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::LifecycleState::*;
    use super::PluginInstance;
    use crate::plugin::{ParseOverrides, parse};

    #[test]
    fn new_instances_start_instantiating() {
        let source = "<config lang=\"json\">{\"name\": \"A\", \"type\": \"web-worker\"}</config>\n<script>api.export({});</script>";
        let descriptor = parse(source, &ParseOverrides::default()).unwrap();
        let instance = PluginInstance::new(descriptor, None, false);
        assert_eq!(instance.state(), Instantiating);
        assert!(instance.state().can_transition_to(Connecting));
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(!Failed.can_transition_to(Terminated));
        assert!(!Terminated.can_transition_to(Ready));
        assert!(Connecting.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Terminated));
    }

    #[test]
    fn handshake_precedes_setup() {
        assert!(Instantiating.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(SettingUp));
        assert!(SettingUp.can_transition_to(Ready));
        assert!(!Instantiating.can_transition_to(SettingUp));
        assert!(!Ready.can_transition_to(Connecting));
    }
}
