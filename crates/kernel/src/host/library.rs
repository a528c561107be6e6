//! Installed plugins and internal plugins.
//!
//! Installed plugins live in the workspace store, one document per plugin
//! keyed by its `_id`, holding the full source in `code` and its digest in
//! `hash`. Restoring re-parses the stored source; a document whose source no
//! longer matches its digest is skipped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use super::PluginHost;
use super::events::HostEvent;
use super::instance::PluginInstance;
use crate::plugin::dependency::DependencyChain;
use crate::plugin::descriptor::{PluginDescriptor, content_digest, doc_id_for};
use crate::plugin::error::PluginError;
use crate::plugin::parser::{ParseOverrides, parse};
use crate::store::{Document, get_optional, upsert};

/// A plugin that could not be restored.
#[derive(Debug)]
pub struct RestoreFailure {
    pub name: String,
    pub error: PluginError,
}

/// Outcome of [`PluginHost::reload_plugins`].
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub loaded: Vec<String>,
    pub failed: Vec<RestoreFailure>,
}

/// An installed plugin as listed from the store.
#[derive(Debug, Clone, Serialize)]
pub struct InstalledPlugin {
    pub name: String,
    pub tag: Option<String>,
    pub version: Option<String>,
    pub origin: Option<String>,
    /// The stored source still matches its digest.
    pub verified: bool,
}

type InstallFuture<'a> = Pin<Box<dyn Future<Output = Result<PluginDescriptor, PluginError>> + Send + 'a>>;

impl PluginHost {
    /// Fetch and store a plugin (and its dependencies) in the workspace.
    ///
    /// Unless `do_not_load` is set the plugin is loaded afterwards.
    pub async fn install_plugin(
        &self,
        reference: &str,
        tag: Option<String>,
        do_not_load: bool,
    ) -> Result<PluginDescriptor, PluginError> {
        let descriptor = self
            .install_recursive(reference.to_string(), tag, DependencyChain::new())
            .await?;
        if !do_not_load {
            self.reload_plugin(descriptor.clone()).await?;
        }
        Ok(descriptor)
    }

    fn install_recursive(
        &self,
        reference: String,
        tag: Option<String>,
        chain: DependencyChain,
    ) -> InstallFuture<'_> {
        Box::pin(async move {
            let scope = self.available_plugins();
            let overrides = ParseOverrides::default().with_tag(tag);
            let (descriptor, _) = self.get_plugin_source(&reference, &scope, overrides).await?;
            let origin = descriptor
                .origin
                .clone()
                .unwrap_or_else(|| descriptor.name.clone());
            let chain = chain.enter(&origin).map_err(|cycle| {
                PluginError::DependencyCycleDetected {
                    plugin: descriptor.name.clone(),
                    chain: cycle,
                }
            })?;

            for dependency in &descriptor.dependencies {
                self.install_recursive(dependency.clone(), None, chain.clone())
                    .await
                    .map_err(|cause| PluginError::DependencyLoadFailed {
                        plugin: descriptor.name.clone(),
                        dependency: dependency.clone(),
                        cause: Box::new(cause),
                    })?;
            }

            self.save_plugin(&descriptor).await?;
            self.emit(HostEvent::PluginInstalled {
                name: descriptor.name.clone(),
            });
            info!(plugin = %descriptor.name, tag = ?descriptor.tag, "plugin installed");
            Ok(descriptor)
        })
    }

    /// Write `descriptor` to the workspace store with a fresh digest.
    pub async fn save_plugin(&self, descriptor: &PluginDescriptor) -> Result<(), PluginError> {
        let mut stored = descriptor.clone();
        stored.doc_id = doc_id_for(&descriptor.name);
        stored.hash = Some(content_digest(&stored.code));
        let doc = Document::from_serializable(stored.doc_id.clone(), &stored)
            .map_err(|e| PluginError::store(&stored.doc_id, e))?;
        let store = self.workspace_store().await?;
        upsert(store.as_ref(), doc)
            .await
            .map_err(|e| PluginError::store(&stored.doc_id, e))?;
        Ok(())
    }

    /// Remove an installed plugin and unload it. Missing plugins only unload.
    pub async fn remove_plugin(&self, name: &str) -> Result<(), PluginError> {
        self.unload_plugin(name).await;
        let id = doc_id_for(name);
        let store = self.workspace_store().await?;
        if let Some(doc) = get_optional(store.as_ref(), &id)
            .await
            .map_err(|e| PluginError::store(&id, e))?
        {
            store
                .remove(&doc)
                .await
                .map_err(|e| PluginError::store(&id, e))?;
            info!(plugin = %name, "plugin removed");
        }
        Ok(())
    }

    async fn installed_descriptor(&self, name: &str) -> Result<Option<PluginDescriptor>, PluginError> {
        let id = doc_id_for(name);
        let store = self.workspace_store().await?;
        let Some(doc) = get_optional(store.as_ref(), &id)
            .await
            .map_err(|e| PluginError::store(&id, e))?
        else {
            return Ok(None);
        };
        doc.decode()
            .map(Some)
            .map_err(|e| PluginError::store(&id, e))
    }

    pub async fn get_plugin_docs(&self, name: &str) -> Result<Option<String>, PluginError> {
        if let Some(instance) = self.instance(name) {
            return Ok(instance.config().docs);
        }
        Ok(self
            .installed_descriptor(name)
            .await?
            .and_then(|d| d.docs))
    }

    /// Stored source text of an installed plugin.
    pub async fn get_installed_source(&self, name: &str) -> Result<Option<String>, PluginError> {
        Ok(self.installed_descriptor(name).await?.map(|d| d.code))
    }

    /// Installed plugins of the current workspace, ordered by name.
    pub async fn installed_plugins(&self) -> Result<Vec<InstalledPlugin>, PluginError> {
        let store = self.workspace_store().await?;
        let docs = store
            .all_docs()
            .await
            .map_err(|e| PluginError::store(self.workspace(), e))?;
        let mut installed = Vec::new();
        for doc in docs {
            match doc.decode::<PluginDescriptor>() {
                Ok(descriptor) => installed.push(InstalledPlugin {
                    verified: descriptor.verify_content_hash().is_ok(),
                    name: descriptor.name,
                    tag: descriptor.tag,
                    version: descriptor.version,
                    origin: descriptor.origin,
                }),
                Err(e) => warn!(doc = %doc.id, error = %e, "unreadable plugin document"),
            }
        }
        installed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(installed)
    }

    /// Load every installed plugin, then the startup internal plugins.
    ///
    /// One plugin failing (including a digest mismatch) never stops the
    /// others.
    pub async fn reload_plugins(&self) -> Result<RestoreReport, PluginError> {
        let store = self.workspace_store().await?;
        let docs = store
            .all_docs()
            .await
            .map_err(|e| PluginError::store(self.workspace(), e))?;
        let mut report = RestoreReport::default();
        for doc in docs {
            let name = doc
                .field("name")
                .and_then(serde_json::Value::as_str)
                .unwrap_or(&doc.id)
                .to_string();
            match self.restore_one(&doc).await {
                Ok(()) => report.loaded.push(name),
                Err(error) => {
                    warn!(plugin = %name, error = %error, "skipping installed plugin");
                    report.failed.push(RestoreFailure { name, error });
                }
            }
        }
        for (name, result) in self.reload_internal_plugins(true).await {
            match result {
                Ok(()) => report.loaded.push(name),
                Err(error) => report.failed.push(RestoreFailure { name, error }),
            }
        }
        info!(loaded = report.loaded.len(), failed = report.failed.len(), "installed plugins restored");
        Ok(report)
    }

    async fn restore_one(&self, doc: &Document) -> Result<(), PluginError> {
        let stored: PluginDescriptor = doc
            .decode()
            .map_err(|e| PluginError::store(&doc.id, e))?;
        stored.verify_content_hash()?;
        let overrides = ParseOverrides {
            tag: stored.tag.clone(),
            doc_id: Some(stored.doc_id.clone()),
            uri: stored.uri.clone(),
            origin: stored.origin.clone(),
            namespace: stored.namespace.clone(),
            engine_mode: stored.engine_mode.clone(),
            compute_hash: true,
            ..ParseOverrides::default()
        };
        let descriptor = parse(&stored.code, &overrides)?;
        self.reload_plugin(descriptor).await.map(|_| ())
    }

    /// Load the internal plugins marked for startup.
    ///
    /// With `skip_existing`, plugins already running are left alone.
    pub async fn reload_internal_plugins(
        &self,
        skip_existing: bool,
    ) -> Vec<(String, Result<(), PluginError>)> {
        let internal: Vec<(String, String)> = self
            .inner
            .config
            .internal_plugins
            .iter()
            .filter(|(_, p)| p.startup)
            .map(|(name, p)| (name.clone(), p.uri.clone()))
            .collect();
        let mut results = Vec::new();
        for (name, uri) in internal {
            if skip_existing && self.instance(&name).is_some() {
                continue;
            }
            let result = self.load_from_reference(&uri, None).await.map(|_| ());
            if let Err(e) = &result {
                warn!(plugin = %name, error = %e, "failed to load internal plugin");
            }
            results.push((name, result));
        }
        results
    }

    /// Load an internal plugin by name.
    pub(crate) async fn load_internal_plugin(
        &self,
        name: &str,
    ) -> Result<Option<Arc<PluginInstance>>, PluginError> {
        let Some(internal) = self.inner.config.internal_plugins.get(name) else {
            return Ok(None);
        };
        let uri = internal.uri.clone();
        self.load_from_reference(&uri, None).await
    }
}
