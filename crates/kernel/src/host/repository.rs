//! Repository and workspace lists, kept in the config store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::PluginHost;
use crate::plugin::descriptor::doc_id_for;
use crate::plugin::error::PluginError;
use crate::plugin::manifest::RepoManifest;
use crate::store::{Document, DocumentStore, StoreError, get_optional, upsert};

const REPOSITORY_LIST: &str = "repository_list";
const WORKSPACE_LIST: &str = "workspace_list";
const GITHUB_PREFIX: &str = "https://github.com/";

/// A plugin repository known to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

impl RepositoryEntry {
    /// Entry from a bare `owner/repo` or url: name, url and description
    /// all start out as that string.
    pub fn from_shorthand(repo: &str) -> Self {
        Self {
            name: repo.to_string(),
            url: repo.to_string(),
            description: repo.to_string(),
        }
    }

    fn normalized_url(&self) -> String {
        normalize_repo_url(&self.url)
    }
}

fn normalize_repo_url(url: &str) -> String {
    url.trim()
        .trim_start_matches(GITHUB_PREFIX)
        .trim_end_matches('/')
        .to_string()
}

async fn read_list<T: for<'de> Deserialize<'de>>(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Option<Vec<T>>, PluginError> {
    let Some(doc) = get_optional(store, id)
        .await
        .map_err(|e| PluginError::store(id, e))?
    else {
        return Ok(None);
    };
    let list = doc.field("list").cloned().unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(list)
        .map(Some)
        .map_err(|e| PluginError::store(id, StoreError::Backend(e.to_string())))
}

async fn write_list<T: Serialize>(
    store: &dyn DocumentStore,
    id: &str,
    list: &[T],
) -> Result<(), PluginError> {
    let mut body = Map::new();
    body.insert("list".into(), json!(list));
    upsert(store, Document::new(id, body))
        .await
        .map_err(|e| PluginError::store(id, e))?;
    Ok(())
}

impl PluginHost {
    pub fn repositories(&self) -> Vec<RepositoryEntry> {
        self.inner.repositories.read().clone()
    }

    /// Read the repository list; a missing list is initialized with the
    /// configured defaults.
    pub async fn load_repository_list(&self) -> Result<Vec<RepositoryEntry>, PluginError> {
        let store = self.config_store().await?;
        let list = match read_list(store.as_ref(), REPOSITORY_LIST).await? {
            Some(list) => list,
            None => {
                let defaults: Vec<RepositoryEntry> = self
                    .inner
                    .config
                    .default_repositories
                    .iter()
                    .map(|r| RepositoryEntry::from_shorthand(r))
                    .collect();
                write_list(store.as_ref(), REPOSITORY_LIST, &defaults).await?;
                defaults
            }
        };
        *self.inner.repositories.write() = list.clone();
        Ok(list)
    }

    /// Add a repository after fetching its manifest.
    ///
    /// The manifest's name and description replace the entry's. An entry
    /// with the same url is replaced; a different repository with the same
    /// name makes the new entry fall back to its url as name.
    pub async fn add_repository(&self, entry: RepositoryEntry) -> Result<RepositoryEntry, PluginError> {
        let manifest = self
            .inner
            .resolver
            .manifests()
            .refresh(&entry.url, None)
            .await?;
        let mut entry = entry;
        if let Some(name) = manifest.name.as_deref().filter(|n| !n.is_empty()) {
            entry.name = name.to_string();
        }
        if let Some(description) = manifest.description.as_deref() {
            entry.description = description.to_string();
        }

        let list = {
            let mut repositories = self.inner.repositories.write();
            let url = entry.normalized_url();
            repositories.retain(|r| r.normalized_url() != url);
            if repositories.iter().any(|r| r.name == entry.name) {
                entry.name = url;
            }
            repositories.push(entry.clone());
            repositories.clone()
        };
        let store = self.config_store().await?;
        write_list(store.as_ref(), REPOSITORY_LIST, &list).await?;
        info!(repository = %entry.name, url = %entry.url, "repository added");
        Ok(entry)
    }

    /// Remove a repository by name or url. Returns whether one was removed.
    pub async fn remove_repository(&self, name_or_url: &str) -> Result<bool, PluginError> {
        let target = normalize_repo_url(name_or_url);
        let (removed, list) = {
            let mut repositories = self.inner.repositories.write();
            let before = repositories.len();
            repositories.retain(|r| r.name != name_or_url && r.normalized_url() != target);
            (repositories.len() != before, repositories.clone())
        };
        if removed {
            let store = self.config_store().await?;
            write_list(store.as_ref(), REPOSITORY_LIST, &list).await?;
        }
        Ok(removed)
    }

    /// Fetch a repository's manifest and make its plugins the scope for bare
    /// names. Installed plugins are marked with their installed tag.
    pub async fn reload_repository(&self, entry: &RepositoryEntry) -> Result<RepoManifest, PluginError> {
        let mut manifest = self
            .inner
            .resolver
            .manifests()
            .refresh(&entry.url, None)
            .await?;
        let store = self.workspace_store().await?;
        for plugin in &mut manifest.plugins {
            let id = plugin.doc_id.clone().unwrap_or_else(|| doc_id_for(&plugin.name));
            match get_optional(store.as_ref(), &id).await {
                Ok(Some(doc)) => {
                    plugin.installed = true;
                    plugin.tag = doc
                        .field("tag")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                Ok(None) => plugin.installed = false,
                Err(e) => warn!(plugin = %plugin.name, error = %e, "failed to check installed plugin"),
            }
        }
        *self.inner.available.write() = manifest.plugins.clone();
        info!(repository = %entry.name, plugins = manifest.plugins.len(), "repository loaded");
        Ok(manifest)
    }

    pub fn workspaces(&self) -> Vec<String> {
        self.inner.workspaces.read().clone()
    }

    /// Read the workspace list; a missing list becomes `["default"]`.
    pub async fn load_workspace_list(&self) -> Result<Vec<String>, PluginError> {
        let store = self.config_store().await?;
        let list = match read_list::<String>(store.as_ref(), WORKSPACE_LIST).await? {
            Some(list) if !list.is_empty() => list,
            _ => {
                let defaults = vec!["default".to_string()];
                write_list(store.as_ref(), WORKSPACE_LIST, &defaults).await?;
                defaults
            }
        };
        *self.inner.workspaces.write() = list.clone();
        Ok(list)
    }

    /// Switch to `name`, adding it to the list when new. Running plugins are
    /// unloaded and the workspace's installed plugins restored.
    pub async fn load_workspace(&self, name: &str) -> Result<super::RestoreReport, PluginError> {
        let (added, list) = {
            let mut workspaces = self.inner.workspaces.write();
            let added = !workspaces.iter().any(|w| w == name);
            if added {
                workspaces.push(name.to_string());
            }
            (added, workspaces.clone())
        };
        if added {
            let store = self.config_store().await?;
            write_list(store.as_ref(), WORKSPACE_LIST, &list).await?;
        }
        for instance in self.instances() {
            if !instance.is_live() {
                self.unload(&instance).await;
            }
        }
        *self.inner.workspace.write() = name.to_string();
        info!(workspace = %name, "workspace loaded");
        self.reload_plugins().await
    }

    /// Drop a workspace from the list and delete its installed plugins.
    pub async fn remove_workspace(&self, name: &str) -> Result<(), PluginError> {
        let list = {
            let mut workspaces = self.inner.workspaces.write();
            workspaces.retain(|w| w != name);
            workspaces.clone()
        };
        let config = self.config_store().await?;
        write_list(config.as_ref(), WORKSPACE_LIST, &list).await?;

        let store_name = format!("{name}_workspace");
        let store = self.open_store(&store_name).await?;
        let docs = store
            .all_docs()
            .await
            .map_err(|e| PluginError::store(&store_name, e))?;
        for doc in docs {
            store
                .remove(&doc)
                .await
                .map_err(|e| PluginError::store(&doc.id, e))?;
        }
        info!(workspace = %name, "workspace removed");
        Ok(())
    }
}
