//! Instance lifecycle: instantiate, connect, setup or resume, hot reload,
//! unload.
//!
//! A load waits for the sandbox handshake up to the type's timeout. A
//! timeout is not a failure: the instance stays registered, the wait
//! continues in the background, and the instance finishes connecting if the
//! sandbox answers late. Anything that suspends is followed by a check of the
//! instance's `unloaded` flag, since an unload may have arrived meanwhile.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::engine::AUTO_ENGINE;
use super::events::HostEvent;
use super::instance::{LifecycleState, LogLevel, PluginInstance};
use super::window::proxy_api;
use super::{PluginContext, PluginHost};
use crate::plugin::descriptor::PluginDescriptor;
use crate::plugin::error::PluginError;
use crate::sandbox::{HostInterface, SandboxSession, SandboxSignal};
use crate::service::ServiceConfig;

impl PluginHost {
    /// Instantiate `descriptor` and drive it to `Ready`.
    ///
    /// Dependencies are not loaded here; see [`PluginHost::reload_plugin`].
    pub(crate) async fn load_plugin(
        &self,
        descriptor: PluginDescriptor,
    ) -> Result<Arc<PluginInstance>, PluginError> {
        if descriptor.name.contains('/') {
            return Err(PluginError::InvalidPluginName {
                name: descriptor.name,
            });
        }
        descriptor.verify_content_hash()?;

        if descriptor.plugin_type.is_proxy() {
            return Ok(self.load_proxy(descriptor));
        }

        let engine = if descriptor.has_backend() {
            None
        } else {
            let mode = descriptor
                .engine_mode
                .clone()
                .unwrap_or_else(|| AUTO_ENGINE.to_string());
            let Some(engine) = self.select_engine(&mode) else {
                let name = descriptor.name.clone();
                self.remember_orphan(descriptor);
                return Err(PluginError::SandboxFailed {
                    plugin: name,
                    message: format!("no connected engine for engine mode '{mode}'"),
                });
            };
            Some(engine.url)
        };

        let instance = Arc::new(PluginInstance::new(descriptor.clone(), engine.clone(), false));
        self.insert_instance(&instance);
        instance.log(LogLevel::Info, format!("Loading plugin {}", descriptor.name));
        debug!(plugin = %descriptor.name, id = %descriptor.id, plugin_type = %descriptor.plugin_type, "instantiating sandbox");

        let interface = self.interface_for(&instance, engine);
        let session = match self.inner.transport.instantiate(&descriptor, interface).await {
            Ok(session) => session,
            Err(e) => {
                let err = PluginError::SandboxFailed {
                    plugin: descriptor.name.clone(),
                    message: format!("{e:#}"),
                };
                self.fail(&instance, &err).await;
                return Err(err);
            }
        };
        self.await_connection(instance, session).await
    }

    /// Attach a sandbox session that was established outside the host.
    ///
    /// Any plugin of the same name is unloaded first.
    pub async fn connect_plugin(
        &self,
        descriptor: PluginDescriptor,
        session: SandboxSession,
    ) -> Result<Arc<PluginInstance>, PluginError> {
        if let Some(existing) = self.instance(&descriptor.name) {
            self.unload(&existing).await;
        }
        let instance = Arc::new(PluginInstance::new(descriptor, None, true));
        self.insert_instance(&instance);
        instance.log(LogLevel::Info, format!("Connecting plugin {}", instance.name()));
        self.await_connection(instance, session).await
    }

    pub(crate) fn interface_for(&self, instance: &PluginInstance, engine_url: Option<String>) -> HostInterface {
        HostInterface {
            tag: instance.config().tag,
            workspace: self.workspace(),
            engine_url,
            context: PluginContext::new(self, instance.id(), instance.name()),
        }
    }

    fn load_proxy(&self, descriptor: PluginDescriptor) -> Arc<PluginInstance> {
        let api = proxy_api(&descriptor, Arc::clone(&self.inner.windows));
        let instance = Arc::new(PluginInstance::new(descriptor, None, false));
        instance.api().replace_with(api);
        self.insert_instance(&instance);
        self.register_plugin_services(&instance);
        instance.transition(LifecycleState::Ready);
        instance.log(LogLevel::Info, "Window plugin registered.");
        self.emit(HostEvent::PluginLoaded {
            id: instance.id().to_string(),
            name: instance.name().to_string(),
        });
        info!(plugin = %instance.name(), "window plugin loaded");
        instance
    }

    async fn await_connection(
        &self,
        instance: Arc<PluginInstance>,
        session: SandboxSession,
    ) -> Result<Arc<PluginInstance>, PluginError> {
        let SandboxSession { handle, mut signal } = session;
        instance.set_handle(handle);
        instance.transition(LifecycleState::Connecting);
        instance.set_initializing(true);

        let wait = self.handshake_timeout(&instance.plugin_type());
        match tokio::time::timeout(wait, &mut signal).await {
            Ok(Ok(received)) => {
                self.finish_connection(&instance, received).await?;
                Ok(instance)
            }
            Ok(Err(_)) => {
                let err = PluginError::SandboxFailed {
                    plugin: instance.name().to_string(),
                    message: "sandbox went away before connecting".to_string(),
                };
                self.fail(&instance, &err).await;
                Err(err)
            }
            Err(_) => {
                let warning = PluginError::HandshakeTimeout {
                    plugin: instance.name().to_string(),
                    seconds: wait.as_secs(),
                };
                instance.set_initializing(false);
                instance.log(LogLevel::Warn, warning.to_string());
                warn!(plugin = %instance.name(), error = %warning, "still waiting for the sandbox in the background");
                self.show_message(warning.to_string());

                let host = self.clone();
                let late = Arc::clone(&instance);
                tokio::spawn(async move {
                    match signal.await {
                        Ok(received) => {
                            if let Err(e) = host.finish_connection(&late, received).await {
                                warn!(plugin = %late.name(), error = %e, "late connection failed");
                            }
                        }
                        Err(_) => debug!(plugin = %late.name(), "sandbox went away without connecting"),
                    }
                });
                Ok(instance)
            }
        }
    }

    /// Handle the terminal handshake signal of `instance`.
    pub(crate) async fn finish_connection(
        &self,
        instance: &Arc<PluginInstance>,
        signal: SandboxSignal,
    ) -> Result<(), PluginError> {
        let api = match signal {
            SandboxSignal::Failed(message) => {
                let err = PluginError::SandboxFailed {
                    plugin: instance.name().to_string(),
                    message,
                };
                self.fail(instance, &err).await;
                return Err(err);
            }
            SandboxSignal::Connected(api) => api,
        };
        instance.set_initializing(false);
        if instance.is_unloaded() {
            return Err(self.abort(instance).await);
        }
        instance.api().replace_with(api);
        instance.log(LogLevel::Info, "Plugin connected.");

        let resumed = instance.config().resumed;
        let entry = if resumed && instance.api().has_capability("resume") {
            Some(("resume", LifecycleState::Resuming, "Resuming plugin."))
        } else if instance.api().has_capability("setup") {
            Some(("setup", LifecycleState::SettingUp, "Setting up plugin."))
        } else {
            None
        };
        match entry {
            Some((function, state, milestone)) => {
                instance.transition(state);
                instance.log(LogLevel::Info, milestone);
                if let Some(entry_point) = instance.api().get(function)
                    && let Err(e) = entry_point.call(Vec::new()).await
                {
                    let plugin = instance.name().to_string();
                    let message = format!("{e:#}");
                    let err = if function == "resume" {
                        PluginError::ResumeFailed { plugin, message }
                    } else {
                        PluginError::SetupFailed { plugin, message }
                    };
                    self.fail(instance, &err).await;
                    return Err(err);
                }
            }
            None => {
                warn!(plugin = %instance.name(), "plugin defines neither setup nor resume");
                instance.log(LogLevel::Warn, "No setup() or resume() defined.");
            }
        }

        if instance.is_unloaded() {
            return Err(self.abort(instance).await);
        }
        self.register_plugin_services(instance);
        instance.transition(LifecycleState::Ready);
        self.emit(HostEvent::PluginLoaded {
            id: instance.id().to_string(),
            name: instance.name().to_string(),
        });
        info!(plugin = %instance.name(), id = %instance.id(), "plugin ready");
        Ok(())
    }

    /// Register the plugin's own config as an operation.
    pub(crate) fn register_plugin_services(&self, instance: &PluginInstance) {
        let config = instance.config();
        if !config.runnable {
            return;
        }
        if !instance.api().has_capability("run") {
            debug!(plugin = %config.name, "runnable plugin does not export run() yet");
        }
        match self
            .inner
            .registry
            .register_unchecked(&instance.provider(), ServiceConfig::from_descriptor(&config))
        {
            Ok(key) => self.emit(HostEvent::OpRegistered { key }),
            Err(e) => warn!(plugin = %config.name, error = %e, "failed to register plugin operation"),
        }
    }

    async fn abort(&self, instance: &Arc<PluginInstance>) -> PluginError {
        debug!(plugin = %instance.name(), "connection finished after unload, tearing down");
        if let Err(e) = instance.terminate().await {
            warn!(plugin = %instance.name(), error = %e, "failed to terminate sandbox");
        }
        PluginError::LoadAborted {
            plugin: instance.name().to_string(),
        }
    }

    async fn fail(&self, instance: &Arc<PluginInstance>, err: &PluginError) {
        instance.transition(LifecycleState::Failed);
        instance.log(LogLevel::Error, err.to_string());
        error!(plugin = %instance.name(), error = %err, "plugin failed to load");
        if let Err(e) = instance.terminate().await {
            warn!(plugin = %instance.name(), error = %e, "failed to terminate sandbox");
        }
        self.remove_instance(instance);
    }

    /// Unload `instance`: unregister its services and tear down its sandbox.
    /// Unloading twice is a no-op.
    pub async fn unload(&self, instance: &Arc<PluginInstance>) {
        if !instance.mark_unloaded() {
            return;
        }
        let removed = self
            .inner
            .registry
            .unregister(&instance.provider(), None);
        for id in removed {
            self.emit(HostEvent::ServiceUnregistered {
                provider: instance.name().to_string(),
                id,
            });
        }
        self.remove_instance(instance);
        if let Err(e) = instance.terminate().await {
            warn!(plugin = %instance.name(), error = %e, "failed to terminate sandbox");
        }
        self.emit(HostEvent::PluginUnloaded {
            id: instance.id().to_string(),
            name: instance.name().to_string(),
        });
        info!(plugin = %instance.name(), id = %instance.id(), "plugin unloaded");
    }

    /// Unload a plugin by name or id. Unknown plugins are ignored.
    pub async fn unload_plugin(&self, name_or_id: &str) {
        let instance = self
            .instance(name_or_id)
            .or_else(|| self.instance_by_id(name_or_id));
        if let Some(instance) = instance {
            self.unload(&instance).await;
        }
    }

    /// Load `descriptor` in place of any instance with the same name.
    ///
    /// Hot reloads when the descriptor allows it and the running instance is
    /// compatible, otherwise terminates the old instance and loads anew.
    pub(crate) async fn replace_instance(
        &self,
        descriptor: PluginDescriptor,
    ) -> Result<Arc<PluginInstance>, PluginError> {
        let existing = self
            .instance_by_id(&descriptor.id)
            .or_else(|| self.instance(&descriptor.name));
        if let Some(existing) = existing {
            if descriptor.hot_reloading && can_hot_reload(&existing, &descriptor) {
                match self.hot_reload(&existing, &descriptor).await {
                    Ok(()) => return Ok(existing),
                    Err(e) => {
                        warn!(plugin = %descriptor.name, error = %e, "hot reload failed, reloading from scratch");
                    }
                }
            }
            self.unload(&existing).await;
        }
        self.load_plugin(descriptor).await
    }

    async fn hot_reload(
        &self,
        instance: &Arc<PluginInstance>,
        descriptor: &PluginDescriptor,
    ) -> Result<(), PluginError> {
        descriptor.verify_content_hash()?;
        let Some(handle) = instance.handle() else {
            return Err(PluginError::SandboxFailed {
                plugin: instance.name().to_string(),
                message: "no sandbox to hot reload".to_string(),
            });
        };
        instance.update_config(|config| {
            config.requirements = descriptor.requirements.clone();
            config.script = descriptor.script.clone();
            config.scripts = descriptor.scripts.clone();
            config.styles = descriptor.styles.clone();
            config.links = descriptor.links.clone();
            config.windows = descriptor.windows.clone();
            config.code = descriptor.code.clone();
            config.hash = descriptor.hash.clone();
            config.docs = descriptor.docs.clone();
            config.inputs = descriptor.inputs.clone();
            config.outputs = descriptor.outputs.clone();
            config.ui = descriptor.ui.clone();
        });
        let refreshed = handle
            .hot_reload(&instance.config())
            .await
            .map_err(|e| PluginError::SandboxFailed {
                plugin: instance.name().to_string(),
                message: format!("{e:#}"),
            })?;
        if let Some(api) = refreshed {
            instance.api().replace_with(api);
        }
        if instance.is_unloaded() {
            return Err(PluginError::LoadAborted {
                plugin: instance.name().to_string(),
            });
        }
        self.register_plugin_services(instance);
        if let Some(setup) = instance.api().get("setup") {
            instance.log(LogLevel::Info, "Setting up plugin.");
            setup
                .call(Vec::new())
                .await
                .map_err(|e| PluginError::SetupFailed {
                    plugin: instance.name().to_string(),
                    message: format!("{e:#}"),
                })?;
        }
        instance.log(LogLevel::Info, "Plugin hot reloaded.");
        info!(plugin = %instance.name(), id = %instance.id(), "plugin hot reloaded");
        Ok(())
    }
}

/// Hot reload keeps the sandbox, so everything that shaped it must match.
/// Window plugins have no sandbox to keep.
fn can_hot_reload(existing: &PluginInstance, incoming: &PluginDescriptor) -> bool {
    let current = existing.config();
    !current.plugin_type.is_proxy()
        && current.tag == incoming.tag
        && current.engine_mode == incoming.engine_mode
        && current.namespace == incoming.namespace
}
