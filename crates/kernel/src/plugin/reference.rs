//! Turning plugin references into concrete sources.
//!
//! A reference is one of:
//!
//! - inline source text (anything containing a newline),
//! - `repo:name[@tag]`, where `repo` is a GitHub shorthand or manifest url
//!   optionally suffixed `@hashtag`,
//! - a bare `name[@tag]` looked up in the current scope,
//! - an http(s) url, optionally suffixed `@tag` after the plugin extension.

use url::Url;

use super::error::PluginError;
use super::github;
use super::manifest::{ManifestCache, ManifestEntry, PLUGIN_EXTENSION};

/// True for absolute http and https urls.
pub fn is_http_url(s: &str) -> bool {
    Url::parse(s.trim()).is_ok_and(|u| matches!(u.scheme(), "http" | "https"))
}

fn has_http_scheme(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.contains("http://") || lower.contains("https://")
}

fn split_tag(s: &str) -> (&str, Option<&str>) {
    match s.split_once('@') {
        Some((head, tag)) => (head.trim(), Some(tag.trim()).filter(|t| !t.is_empty())),
        None => (s.trim(), None),
    }
}

/// A reference, classified but not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginReference {
    Inline(String),
    Repo {
        repo: String,
        hashtag: Option<String>,
        name: String,
        tag: Option<String>,
    },
    Bare {
        name: String,
        tag: Option<String>,
    },
    Url(String),
}

impl PluginReference {
    /// Classify a reference string. GitHub page urls are rewritten to raw urls.
    pub fn classify(input: &str) -> Result<Self, PluginError> {
        if input.contains('\n') {
            return Ok(Self::Inline(input.to_string()));
        }
        let input = if github::is_rewritable(input) {
            github::raw_url(input)
        } else {
            input.to_string()
        };

        if !has_http_scheme(&input) && input.contains('/') && input.contains(':') {
            let Some((repo_part, name_part)) = input.split_once(':') else {
                return Err(PluginError::InvalidReferenceFormat {
                    reference: input.clone(),
                    details: "expected REPO:NAME".to_string(),
                });
            };
            let (repo, hashtag) = split_tag(repo_part);
            let (name, tag) = split_tag(name_part);
            if repo.is_empty() || name.is_empty() {
                return Err(PluginError::InvalidReferenceFormat {
                    reference: input.clone(),
                    details: "both the repository and the plugin name are required".to_string(),
                });
            }
            return Ok(Self::Repo {
                repo: repo.to_string(),
                hashtag: hashtag.map(str::to_string),
                name: name.to_string(),
                tag: tag.map(str::to_string),
            });
        }

        if !is_http_url(&input) {
            let (name, tag) = split_tag(&input);
            return Ok(Self::Bare {
                name: name.to_string(),
                tag: tag.map(str::to_string),
            });
        }

        Ok(Self::Url(input))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    /// Source text was given directly.
    Inline(String),
    /// Source must be fetched from this url.
    Uri(String),
}

/// Outcome of resolving a reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub source: ResolvedSource,
    /// Scope for resolving the plugin's own dependencies.
    pub scope: Vec<ManifestEntry>,
    pub tag: Option<String>,
    /// The url does not point at a plugin file; its config comes from the
    /// sandbox transport.
    pub external: bool,
}

impl Resolution {
    pub fn uri(&self) -> Option<&str> {
        match &self.source {
            ResolvedSource::Uri(uri) => Some(uri),
            ResolvedSource::Inline(_) => None,
        }
    }
}

/// Resolves references against repository manifests and scope lists.
#[derive(Clone)]
pub struct SourceResolver {
    manifests: ManifestCache,
}

impl SourceResolver {
    pub fn new(manifests: ManifestCache) -> Self {
        Self { manifests }
    }

    pub fn manifests(&self) -> &ManifestCache {
        &self.manifests
    }

    pub async fn resolve(
        &self,
        reference: &str,
        scope: &[ManifestEntry],
    ) -> Result<Resolution, PluginError> {
        match PluginReference::classify(reference)? {
            PluginReference::Inline(source) => Ok(Resolution {
                source: ResolvedSource::Inline(source),
                scope: scope.to_vec(),
                tag: None,
                external: false,
            }),
            PluginReference::Repo {
                repo,
                hashtag,
                name,
                tag,
            } => {
                let manifest = self.manifests.get(&repo, hashtag.as_deref()).await?;
                let entry = manifest
                    .find(&name)
                    .ok_or_else(|| PluginError::ReferenceNotFound {
                        name: name.clone(),
                        scope: format!("repository '{repo}'"),
                    })?;
                Ok(Resolution {
                    source: ResolvedSource::Uri(entry.uri.clone()),
                    tag,
                    external: false,
                    scope: manifest.plugins.clone(),
                })
            }
            PluginReference::Bare { name, tag } => {
                let entry = scope.iter().find(|p| p.name == name).ok_or_else(|| {
                    PluginError::ReferenceNotFound {
                        name: name.clone(),
                        scope: "the current repository".to_string(),
                    }
                })?;
                Ok(Resolution {
                    source: ResolvedSource::Uri(entry.uri.clone()),
                    scope: scope.to_vec(),
                    tag,
                    external: false,
                })
            }
            PluginReference::Url(url) => {
                let marker = format!("{PLUGIN_EXTENSION}@");
                let (url, tag) = match url.split_once(&marker) {
                    Some((base, tag)) => (
                        format!("{base}{PLUGIN_EXTENSION}"),
                        Some(tag.to_string()).filter(|t| !t.is_empty()),
                    ),
                    None => (url, None),
                };
                let path = url.split('?').next().unwrap_or(&url);
                Ok(Resolution {
                    external: !path.ends_with(PLUGIN_EXTENSION),
                    source: ResolvedSource::Uri(url),
                    scope: scope.to_vec(),
                    tag,
                })
            }
        }
    }
}
