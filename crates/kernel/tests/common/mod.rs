#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Tests drive a real [`PluginHost`] wired to in-process collaborators:
//! plugin sources are served by a [`MemoryFetcher`], sandboxes are
//! [`LoopbackTransport`] programs, and documents live in memory.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use plughost_kernel::fetch::MemoryFetcher;
use plughost_kernel::host::{HostConfig, HostEvent, PluginHost};
use plughost_kernel::sandbox::{LoopbackTransport, PluginApi, capability};
use plughost_kernel::store::MemoryStoreFactory;
use plughost_test_utils::PluginSource;

/// Base url the test fetcher serves plugin files under.
pub const BASE: &str = "https://plugins.test";

/// Url of a plugin file served by the test fetcher.
pub fn plugin_url(name: &str) -> String {
    format!("{BASE}/{name}.imjoy.html")
}

/// A host plus handles on everything it talks to.
pub struct TestHost {
    pub host: PluginHost,
    pub fetcher: MemoryFetcher,
    pub transport: LoopbackTransport,
    pub stores: MemoryStoreFactory,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_config(HostConfig {
            default_repositories: Vec::new(),
            ..HostConfig::default()
        })
    }

    pub fn with_config(config: HostConfig) -> Self {
        let fetcher = MemoryFetcher::new();
        let transport = LoopbackTransport::new();
        let stores = MemoryStoreFactory::new();
        let host = PluginHost::builder(Arc::new(transport.clone()))
            .config(config)
            .fetcher(Arc::new(fetcher.clone()))
            .stores(Arc::new(stores.clone()))
            .build();
        Self {
            host,
            fetcher,
            transport,
            stores,
        }
    }

    /// Serve `source` at [`plugin_url`] of its name and return the url.
    pub fn serve(&self, source: &PluginSource) -> String {
        let url = plugin_url(source.name());
        self.fetcher.insert(url.clone(), source.build());
        url
    }

    /// Instantiation order of the loopback sandbox.
    pub fn instantiated(&self) -> Vec<String> {
        self.transport.stats().instantiated
    }
}

/// Functions a well-behaved plugin exports: `setup` and an echoing `run`.
pub fn echo_api() -> PluginApi {
    PluginApi::new()
        .with("setup", capability(|_| async { Ok(Value::Null) }))
        .with(
            "run",
            capability(|args: Vec<Value>| async move {
                Ok(args.into_iter().next().unwrap_or(Value::Null))
            }),
        )
}

/// Wait for the first event matching `pred`, up to `within`.
pub async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<HostEvent>,
    within: Duration,
    pred: impl Fn(&HostEvent) -> bool,
) -> HostEvent {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("event did not arrive in time")
}
