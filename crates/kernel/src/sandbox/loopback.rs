//! In-process sandbox transport.
//!
//! Plugins are "executed" by Rust programs registered per plugin name. A
//! program receives the descriptor and handshake interface and returns the
//! function set to export. This is what the CLI and tests use; a real
//! deployment plugs in a transport that talks to workers or windows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::{
    HostInterface, PluginApi, SandboxHandle, SandboxSession, SandboxSignal, SandboxTransport,
};
use crate::plugin::descriptor::PluginDescriptor;

/// Builds a plugin's exported functions, or fails the handshake.
pub type Program =
    Arc<dyn Fn(&PluginDescriptor, &HostInterface) -> Result<PluginApi, String> + Send + Sync>;

#[derive(Clone)]
enum Behavior {
    Connect(Program),
    Delayed(Duration, Program),
    Silent,
}

/// Counters of what the transport was asked to do.
#[derive(Debug, Default, Clone)]
pub struct LoopbackStats {
    /// Plugin names in instantiation order.
    pub instantiated: Vec<String>,
    pub terminated: HashMap<String, usize>,
    pub hot_reloads: HashMap<String, usize>,
    /// Handshake payloads, in instantiation order.
    pub handshakes: Vec<Value>,
}

#[derive(Default)]
struct Shared {
    behaviors: Mutex<HashMap<String, Behavior>>,
    externals: Mutex<HashMap<String, Value>>,
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<SandboxSignal>>>>,
    stats: Mutex<LoopbackStats>,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect `name` immediately with the functions built by `program`.
    pub fn register<F>(&self, name: impl Into<String>, program: F)
    where
        F: Fn(&PluginDescriptor, &HostInterface) -> Result<PluginApi, String> + Send + Sync + 'static,
    {
        self.shared
            .behaviors
            .lock()
            .insert(name.into(), Behavior::Connect(Arc::new(program)));
    }

    /// Connect `name` after `delay`.
    pub fn register_delayed<F>(&self, name: impl Into<String>, delay: Duration, program: F)
    where
        F: Fn(&PluginDescriptor, &HostInterface) -> Result<PluginApi, String> + Send + Sync + 'static,
    {
        self.shared
            .behaviors
            .lock()
            .insert(name.into(), Behavior::Delayed(delay, Arc::new(program)));
    }

    /// Never answer the handshake for `name` until [`Self::release`] is called.
    pub fn register_silent(&self, name: impl Into<String>) {
        self.shared
            .behaviors
            .lock()
            .insert(name.into(), Behavior::Silent);
    }

    /// Complete the oldest pending handshake of `name`. Returns false when
    /// nothing was waiting.
    pub fn release(&self, name: &str, api: PluginApi) -> bool {
        let sender = {
            let mut pending = self.shared.pending.lock();
            pending
                .get_mut(name)
                .and_then(|senders| (!senders.is_empty()).then(|| senders.remove(0)))
        };
        match sender {
            Some(tx) => tx.send(SandboxSignal::Connected(api)).is_ok(),
            None => false,
        }
    }

    /// Serve `config` for an external plugin url.
    pub fn insert_external(&self, url: impl Into<String>, config: Value) {
        self.shared.externals.lock().insert(url.into(), config);
    }

    pub fn stats(&self) -> LoopbackStats {
        self.shared.stats.lock().clone()
    }

    pub fn terminated(&self, name: &str) -> usize {
        self.shared
            .stats
            .lock()
            .terminated
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn hot_reloads(&self, name: &str) -> usize {
        self.shared
            .stats
            .lock()
            .hot_reloads
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn behavior(&self, name: &str) -> Behavior {
        self.shared
            .behaviors
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_else(|| Behavior::Connect(Arc::new(|_, _| Ok(PluginApi::new()))))
    }
}

fn signal_from(result: Result<PluginApi, String>) -> SandboxSignal {
    match result {
        Ok(api) => SandboxSignal::Connected(api),
        Err(message) => SandboxSignal::Failed(message),
    }
}

#[async_trait]
impl SandboxTransport for LoopbackTransport {
    async fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        interface: HostInterface,
    ) -> anyhow::Result<SandboxSession> {
        let name = descriptor.name.clone();
        debug!(plugin = %name, "loopback sandbox instantiated");
        {
            let mut stats = self.shared.stats.lock();
            stats.instantiated.push(name.clone());
            stats.handshakes.push(interface.to_json());
        }

        let (tx, rx) = oneshot::channel();
        let kept_interface = interface.clone();
        let behavior = self.behavior(&name);
        let program = match &behavior {
            Behavior::Connect(program) | Behavior::Delayed(_, program) => Some(Arc::clone(program)),
            Behavior::Silent => None,
        };
        match behavior {
            Behavior::Connect(program) => {
                let _ = tx.send(signal_from(program(descriptor, &interface)));
            }
            Behavior::Delayed(delay, program) => {
                let descriptor = descriptor.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(signal_from(program(&descriptor, &interface)));
                });
            }
            Behavior::Silent => {
                self.shared
                    .pending
                    .lock()
                    .entry(name.clone())
                    .or_default()
                    .push(tx);
            }
        }

        let handle = LoopbackHandle {
            name,
            program,
            interface: kept_interface,
            shared: Arc::clone(&self.shared),
        };
        Ok(SandboxSession {
            handle: Arc::new(handle),
            signal: rx,
        })
    }

    async fn external_config(&self, url: &str) -> anyhow::Result<Value> {
        self.shared
            .externals
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no external plugin served at {url}"))
    }
}

struct LoopbackHandle {
    name: String,
    program: Option<Program>,
    interface: HostInterface,
    shared: Arc<Shared>,
}

#[async_trait]
impl SandboxHandle for LoopbackHandle {
    async fn terminate(&self) -> anyhow::Result<()> {
        *self
            .shared
            .stats
            .lock()
            .terminated
            .entry(self.name.clone())
            .or_default() += 1;
        Ok(())
    }

    async fn hot_reload(&self, descriptor: &PluginDescriptor) -> anyhow::Result<Option<PluginApi>> {
        *self
            .shared
            .stats
            .lock()
            .hot_reloads
            .entry(self.name.clone())
            .or_default() += 1;
        let Some(program) = &self.program else {
            return Ok(None);
        };
        program(descriptor, &self.interface)
            .map(Some)
            .map_err(|e| anyhow::anyhow!(e))
    }
}
