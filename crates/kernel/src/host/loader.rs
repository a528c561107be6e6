//! From reference to running plugin.
//!
//! `resolve -> fetch -> parse`, then every dependency goes through the same
//! pipeline (left to right, one at a time) before the plugin itself is
//! instantiated. The chain of origins being loaded is threaded through the
//! recursion to catch cycles. A hot-reloading plugin hot reloads its
//! running dependencies too; otherwise running dependencies are left alone.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info};

use super::PluginHost;
use super::instance::PluginInstance;
use crate::fetch::with_cache_buster;
use crate::plugin::dependency::DependencyChain;
use crate::plugin::descriptor::{PluginDescriptor, PluginType};
use crate::plugin::error::PluginError;
use crate::plugin::manifest::ManifestEntry;
use crate::plugin::parser::{ParseOverrides, parse, parse_external};
use crate::plugin::reference::{Resolution, ResolvedSource};

type LoadFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Arc<PluginInstance>>, PluginError>> + Send + 'a>>;

/// Origin used for cycle detection.
fn origin_of(descriptor: &PluginDescriptor) -> String {
    descriptor
        .origin
        .clone()
        .or_else(|| descriptor.uri.clone())
        .unwrap_or_else(|| descriptor.name.clone())
}

impl PluginHost {
    /// Scope for bare plugin names.
    pub fn available_plugins(&self) -> Vec<ManifestEntry> {
        self.inner.available.read().clone()
    }

    /// Resolve `reference` and parse the plugin it points at.
    ///
    /// The reference's `@tag` (if any) applies unless `overrides.tag` is set.
    pub async fn get_plugin_source(
        &self,
        reference: &str,
        scope: &[ManifestEntry],
        overrides: ParseOverrides,
    ) -> Result<(PluginDescriptor, Resolution), PluginError> {
        let resolution = self.inner.resolver.resolve(reference, scope).await?;
        let mut overrides = overrides;
        if overrides.tag.is_none() {
            overrides.tag = resolution.tag.clone();
        }
        let descriptor = match &resolution.source {
            ResolvedSource::Inline(source) => self.parse_keeping_running_tag(source, &overrides)?,
            ResolvedSource::Uri(uri) if resolution.external => {
                let config = self
                    .inner
                    .transport
                    .external_config(uri)
                    .await
                    .map_err(|e| PluginError::SandboxFailed {
                        plugin: uri.clone(),
                        message: format!("{e:#}"),
                    })?;
                if overrides.origin.is_none() {
                    overrides.origin = Some(reference.to_string());
                }
                parse_external(config, uri, &overrides)?
            }
            ResolvedSource::Uri(uri) => {
                debug!(uri = %uri, "fetching plugin source");
                let source = self
                    .inner
                    .fetcher
                    .fetch_text(&with_cache_buster(uri))
                    .await
                    .map_err(|e| PluginError::fetch(uri.clone(), e))?;
                overrides.uri = Some(uri.clone());
                if overrides.origin.is_none() {
                    overrides.origin = Some(reference.to_string());
                }
                self.parse_keeping_running_tag(&source, &overrides)?
            }
        };
        Ok((descriptor, resolution))
    }

    /// Parse `source`; without an explicit tag, a running instance of the
    /// same plugin keeps the tag it was loaded with.
    fn parse_keeping_running_tag(
        &self,
        source: &str,
        overrides: &ParseOverrides,
    ) -> Result<PluginDescriptor, PluginError> {
        let descriptor = parse(source, overrides)?;
        if overrides.tag.is_some() {
            return Ok(descriptor);
        }
        let running_tag = self
            .instance(&descriptor.name)
            .and_then(|running| running.config().tag)
            .filter(|tag| descriptor.tag.as_ref() != Some(tag) && descriptor.tags.contains(tag));
        match running_tag {
            Some(tag) => parse(source, &overrides.clone().with_tag(Some(tag))),
            None => Ok(descriptor),
        }
    }

    /// Load a plugin from a reference, dependencies first.
    ///
    /// Returns `None` for collections, which only load their dependencies.
    pub async fn load_from_reference(
        &self,
        reference: &str,
        tag: Option<String>,
    ) -> Result<Option<Arc<PluginInstance>>, PluginError> {
        let scope = self.available_plugins();
        let overrides = ParseOverrides::default().with_tag(tag);
        let (descriptor, resolution) = self.get_plugin_source(reference, &scope, overrides).await?;
        self.load_recursive(descriptor, resolution.scope, DependencyChain::new())
            .await
    }

    /// Load `descriptor`, its dependencies first, replacing any running
    /// instance of the same name.
    pub async fn reload_plugin(
        &self,
        descriptor: PluginDescriptor,
    ) -> Result<Option<Arc<PluginInstance>>, PluginError> {
        let scope = self.available_plugins();
        self.load_recursive(descriptor, scope, DependencyChain::new())
            .await
    }

    fn load_recursive(
        &self,
        descriptor: PluginDescriptor,
        scope: Vec<ManifestEntry>,
        chain: DependencyChain,
    ) -> LoadFuture<'_> {
        Box::pin(async move {
            let chain = chain.enter(&origin_of(&descriptor)).map_err(|cycle| {
                PluginError::DependencyCycleDetected {
                    plugin: descriptor.name.clone(),
                    chain: cycle,
                }
            })?;

            for dependency in &descriptor.dependencies {
                self.load_dependency(&descriptor, dependency, &scope, &chain)
                    .await
                    .map_err(|cause| PluginError::DependencyLoadFailed {
                        plugin: descriptor.name.clone(),
                        dependency: dependency.clone(),
                        cause: Box::new(cause),
                    })?;
            }

            if descriptor.plugin_type == PluginType::Collection {
                info!(plugin = %descriptor.name, dependencies = descriptor.dependencies.len(), "collection loaded");
                return Ok(None);
            }
            self.replace_instance(descriptor).await.map(Some)
        })
    }

    async fn load_dependency(
        &self,
        parent: &PluginDescriptor,
        dependency: &str,
        scope: &[ManifestEntry],
        chain: &DependencyChain,
    ) -> Result<(), PluginError> {
        let overrides = ParseOverrides {
            namespace: parent.namespace.clone(),
            hot_reloading: parent.hot_reloading,
            ..ParseOverrides::default()
        };
        let (descriptor, resolution) = self.get_plugin_source(dependency, scope, overrides).await?;
        if !parent.hot_reloading
            && let Some(running) = self.instance(&descriptor.name)
            && !running.is_unloaded()
            && !running.state().is_terminal()
        {
            debug!(plugin = %parent.name, dependency = %descriptor.name, "dependency already loaded");
            return Ok(());
        }
        debug!(plugin = %parent.name, dependency = %descriptor.name, depth = chain.depth(), "loading dependency");
        self.load_recursive(descriptor, resolution.scope, chain.clone())
            .await
            .map(|_| ())
    }
}
