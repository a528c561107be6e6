//! Repository manifests: fetch, normalize, and cache.
//!
//! A repository is named either by a GitHub shorthand (`owner/repo`), a GitHub
//! url, or the direct url of a `manifest.imjoy.json`. Normalization drops
//! disabled entries and makes every plugin uri absolute, so entries can be
//! used as a resolution scope without further context.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::descriptor::doc_id_for;
use super::error::PluginError;
use super::github;
use super::reference::is_http_url;
use crate::fetch::{SourceFetcher, fetch_json};

/// Canonical plugin file extension.
pub const PLUGIN_EXTENSION: &str = ".imjoy.html";

/// # Panics
///
/// Panics if the regex pattern is invalid (compile-time constant, should never fail).
#[allow(clippy::expect_used)]
static SHORTHAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^/.]+/[^/.]+$").expect("repo shorthand regex is valid"));

/// One plugin listed by a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(rename = "_id", default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub plugin_type: Option<String>,
    /// Set by the host when a plugin of the same name is installed.
    #[serde(default)]
    pub installed: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManifestEntry {
    /// Entry for a plugin known only by name and uri.
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            tag: None,
            tags: Vec::new(),
            disabled: false,
            origin: None,
            doc_id: None,
            description: None,
            plugin_type: None,
            installed: false,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub uri_root: Option<String>,
    pub plugins: Vec<ManifestEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RepoManifest {
    pub fn find(&self, name: &str) -> Option<&ManifestEntry> {
        self.plugins.iter().find(|p| p.name == name)
    }
}

/// Where a repository's manifest lives and how its plugins are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLocation {
    pub manifest_url: String,
    /// Prefix of every entry's `origin` (`owner/repo[@hashtag]` for GitHub).
    pub origin: String,
}

/// Work out the manifest url for a repository reference.
pub fn locate(repo: &str, hashtag: Option<&str>) -> RepoLocation {
    let repo = repo.trim();
    if SHORTHAND.is_match(repo) {
        let (page, origin) = match hashtag {
            Some(h) => (
                format!("https://github.com/{repo}/tree/{h}"),
                format!("{repo}@{h}"),
            ),
            None => (format!("https://github.com/{repo}"), repo.to_string()),
        };
        let manifest_url = github::manifest_url(&page).unwrap_or(page);
        return RepoLocation {
            manifest_url,
            origin,
        };
    }
    if repo.contains("github.com") {
        return RepoLocation {
            manifest_url: github::manifest_url(repo).unwrap_or_else(|| repo.to_string()),
            origin: github::repo_slug(repo).unwrap_or_else(|| repo.to_string()),
        };
    }
    RepoLocation {
        manifest_url: repo.to_string(),
        origin: repo.to_string(),
    }
}

/// Drop disabled entries and make every plugin uri absolute.
pub fn normalize(mut manifest: RepoManifest, location: &RepoLocation) -> RepoManifest {
    manifest.plugins.retain(|p| !p.disabled);

    let declared_root = manifest.uri_root.clone().unwrap_or_default();
    let uri_root = if is_http_url(&declared_root) {
        declared_root
    } else {
        let base = location
            .manifest_url
            .strip_suffix(github::MANIFEST_FILE)
            .unwrap_or(&location.manifest_url);
        format!("{base}{}", declared_root.trim_matches('/'))
    };
    let uri_root = uri_root.trim_end_matches('/').to_string();

    for entry in &mut manifest.plugins {
        if entry.uri.is_empty() {
            entry.uri = format!("{}{PLUGIN_EXTENSION}", entry.name);
        }
        entry.origin = Some(format!("{}:{}", location.origin, entry.name));
        if !entry.uri.starts_with(&uri_root) && !is_http_url(&entry.uri) {
            entry.uri = format!("{uri_root}/{}", entry.uri.trim_start_matches('/'));
        }
        if entry.doc_id.is_none() {
            entry.doc_id = Some(doc_id_for(&entry.name));
        }
    }
    manifest.uri_root = Some(uri_root);
    manifest
}

/// Fetches manifests and keeps the normalized result per manifest url.
#[derive(Clone)]
pub struct ManifestCache {
    fetcher: Arc<dyn SourceFetcher>,
    cache: Arc<DashMap<String, RepoManifest>>,
}

impl ManifestCache {
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            fetcher,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Normalized manifest, served from cache when available.
    pub async fn get(&self, repo: &str, hashtag: Option<&str>) -> Result<RepoManifest, PluginError> {
        let location = locate(repo, hashtag);
        if let Some(cached) = self.cache.get(&location.manifest_url) {
            return Ok(cached.value().clone());
        }
        self.fetch(&location).await
    }

    /// Normalized manifest, always fetched anew.
    pub async fn refresh(
        &self,
        repo: &str,
        hashtag: Option<&str>,
    ) -> Result<RepoManifest, PluginError> {
        self.fetch(&locate(repo, hashtag)).await
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    async fn fetch(&self, location: &RepoLocation) -> Result<RepoManifest, PluginError> {
        debug!(url = %location.manifest_url, "fetching repository manifest");
        let raw: RepoManifest = fetch_json(self.fetcher.as_ref(), &location.manifest_url)
            .await
            .map_err(|e| PluginError::fetch(location.manifest_url.clone(), e))?;
        let manifest = normalize(raw, location);
        self.cache
            .insert(location.manifest_url.clone(), manifest.clone());
        Ok(manifest)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use serde_json::json;

    fn manifest(value: Value) -> RepoManifest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn shorthand_with_hashtag_points_at_branch() {
        let loc = locate("acme/plugins", Some("dev"));
        assert_eq!(
            loc.manifest_url,
            "https://raw.githubusercontent.com/acme/plugins/dev/manifest.imjoy.json"
        );
        assert_eq!(loc.origin, "acme/plugins@dev");

        let direct = locate("https://example.org/repo/manifest.imjoy.json", None);
        assert_eq!(direct.origin, direct.manifest_url);
    }

    #[test]
    fn normalize_filters_and_absolutizes() {
        let loc = locate("acme/plugins", None);
        let m = normalize(
            manifest(json!({
                "name": "Acme",
                "uri_root": "/repository/",
                "plugins": [
                    { "name": "Image Viewer" },
                    { "name": "Old", "disabled": true },
                    { "name": "Remote", "uri": "https://cdn.example.org/Remote.imjoy.html" },
                    { "name": "Nested", "uri": "sub/Nested.imjoy.html" }
                ]
            })),
            &loc,
        );
        let root = "https://raw.githubusercontent.com/acme/plugins/master/repository";
        assert_eq!(m.uri_root.as_deref(), Some(root));
        assert_eq!(m.plugins.len(), 3);
        assert!(m.find("Old").is_none());

        let viewer = m.find("Image Viewer").unwrap();
        assert_eq!(viewer.uri, format!("{root}/Image Viewer.imjoy.html"));
        assert_eq!(viewer.origin.as_deref(), Some("acme/plugins:Image Viewer"));
        assert_eq!(viewer.doc_id.as_deref(), Some("Image_Viewer"));
        assert_eq!(m.find("Remote").unwrap().uri, "https://cdn.example.org/Remote.imjoy.html");
        assert_eq!(m.find("Nested").unwrap().uri, format!("{root}/sub/Nested.imjoy.html"));
    }

    #[tokio::test]
    async fn cache_serves_repeat_requests() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert(
            "https://example.org/r/manifest.imjoy.json",
            json!({ "plugins": [{ "name": "A" }] }).to_string(),
        );
        let cache = ManifestCache::new(Arc::new(fetcher.clone()));
        let first = cache.get("https://example.org/r/manifest.imjoy.json", None).await.unwrap();
        let second = cache.get("https://example.org/r/manifest.imjoy.json", None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.requests().len(), 1);
        assert_eq!(first.find("A").unwrap().uri, "https://example.org/r/A.imjoy.html");

        cache.refresh("https://example.org/r/manifest.imjoy.json", None).await.unwrap();
        assert_eq!(fetcher.requests().len(), 2);
    }

    #[tokio::test]
    async fn manifest_without_plugins_is_rejected() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://example.org/bad.json", json!({ "name": "x" }).to_string());
        let cache = ManifestCache::new(Arc::new(fetcher));
        let err = cache.get("https://example.org/bad.json", None).await.unwrap_err();
        assert!(matches!(err, PluginError::Fetch { .. }));
    }
}
