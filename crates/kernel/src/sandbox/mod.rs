//! Sandbox transport seam.
//!
//! The host never sees how plugin code is isolated. It asks a
//! [`SandboxTransport`] to instantiate a descriptor, sends the handshake
//! interface along, and then waits on the session's signal for either
//! [`SandboxSignal::Connected`] (carrying the plugin's exported functions) or
//! [`SandboxSignal::Failed`].
//!
//! Plugin functions are modelled as a capability map rather than a fixed
//! interface: callers probe with [`PluginApi::has_capability`] before calling.

mod loopback;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::oneshot;

pub use loopback::{LoopbackStats, LoopbackTransport, Program};

use crate::host::PluginContext;
use crate::plugin::descriptor::PluginDescriptor;

/// One callable exported by a plugin (or provided by the host on its behalf).
#[async_trait]
pub trait Capability: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

struct FnCapability<F>(F);

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a capability.
pub fn capability<F, Fut>(f: F) -> Arc<dyn Capability>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnCapability(f))
}

/// The set of functions a connected plugin exposes.
///
/// Interior mutability lets hot reload swap the functions while every holder
/// of the `Arc<PluginApi>` keeps the same object.
#[derive(Default)]
pub struct PluginApi {
    functions: RwLock<HashMap<String, Arc<dyn Capability>>>,
}

impl PluginApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(self, name: impl Into<String>, function: Arc<dyn Capability>) -> Self {
        self.insert(name, function);
        self
    }

    pub fn insert(&self, name: impl Into<String>, function: Arc<dyn Capability>) {
        self.functions.write().insert(name.into(), function);
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.functions.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace every function with those of `other`, keeping this object.
    pub fn replace_with(&self, other: PluginApi) {
        let incoming = other.functions.into_inner();
        *self.functions.write() = incoming;
    }
}

impl fmt::Debug for PluginApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginApi")
            .field("functions", &self.names())
            .finish()
    }
}

/// Terminal signal of a sandbox handshake.
pub enum SandboxSignal {
    Connected(PluginApi),
    Failed(String),
}

impl fmt::Debug for SandboxSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(api) => f.debug_tuple("Connected").field(api).finish(),
            Self::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Control surface of a running sandbox.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    async fn terminate(&self) -> anyhow::Result<()>;

    /// Re-execute the plugin body without a new handshake. Returns the
    /// refreshed function set when the sandbox re-exported it.
    async fn hot_reload(&self, descriptor: &PluginDescriptor) -> anyhow::Result<Option<PluginApi>>;
}

/// A freshly instantiated sandbox waiting for its handshake to finish.
pub struct SandboxSession {
    pub handle: Arc<dyn SandboxHandle>,
    pub signal: oneshot::Receiver<SandboxSignal>,
}

/// Creates sandboxes.
#[async_trait]
pub trait SandboxTransport: Send + Sync {
    async fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        interface: HostInterface,
    ) -> anyhow::Result<SandboxSession>;

    /// Config of a plugin served from a url that is not a plugin file.
    async fn external_config(&self, url: &str) -> anyhow::Result<Value> {
        bail!("this sandbox transport cannot load external plugins ({url})")
    }
}

/// Handshake payload: host settings plus a handle back into the host API.
#[derive(Clone)]
pub struct HostInterface {
    pub tag: Option<String>,
    pub workspace: String,
    pub engine_url: Option<String>,
    pub context: PluginContext,
}

impl HostInterface {
    pub fn config(&self) -> Value {
        json!({
            "tag": self.tag,
            "workspace": self.workspace,
            "engine": self.engine_url,
        })
    }

    /// Settings part of the handshake as sent to the sandbox.
    pub fn to_json(&self) -> Value {
        json!({
            "TAG": self.tag,
            "WORKSPACE": self.workspace,
            "ENGINE_URL": self.engine_url,
            "config": self.config(),
        })
    }
}

impl fmt::Debug for HostInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInterface")
            .field("tag", &self.tag)
            .field("workspace", &self.workspace)
            .field("engine_url", &self.engine_url)
            .finish_non_exhaustive()
    }
}
