//! Fetching plugin sources and repository manifests.
//!
//! The host only needs "GET a url, give me the body". [`HttpFetcher`] does this
//! over the network; [`MemoryFetcher`] serves fixed pages for tests and
//! offline use.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("server answered {status}")]
    Status { status: u16 },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("response body is empty")]
    EmptyBody,

    #[error("response is not valid JSON: {0}")]
    Decode(String),
}

/// Source of remote text documents.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the body at `url`. Empty bodies are an error.
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// Fetch and decode a JSON document.
pub async fn fetch_json<T: DeserializeOwned>(
    fetcher: &dyn SourceFetcher,
    url: &str,
) -> Result<T, FetchError> {
    let body = fetcher.fetch_text(url).await?;
    serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
}

/// Append a random query string so caches are bypassed, unless one is present.
pub fn with_cache_buster(url: &str) -> String {
    if url.contains('?') {
        url.to_string()
    } else {
        format!("{url}?{}", crate::plugin::descriptor::rand_id())
    }
}

/// Network fetcher backed by `reqwest`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plughost/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        debug!(url = %url, "fetching");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody);
        }
        Ok(body)
    }
}

/// Fixed set of pages keyed by url, ignoring any query string.
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    pages: Arc<DashMap<String, String>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<String>) {
        self.pages.insert(url.into(), body.into());
    }

    pub fn remove(&self, url: &str) {
        self.pages.remove(url);
    }

    /// Every url requested so far, without query strings.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[async_trait]
impl SourceFetcher for MemoryFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let key = strip_query(url);
        self.requests.lock().push(key.to_string());
        let Some(body) = self.pages.get(key).map(|b| b.value().clone()) else {
            return Err(FetchError::Status { status: 404 });
        };
        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody);
        }
        Ok(body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_fetcher_ignores_query_strings() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://x.org/a.imjoy.html", "<config>{}</config>");
        let body = fetcher
            .fetch_text(&with_cache_buster("https://x.org/a.imjoy.html"))
            .await
            .unwrap();
        assert!(body.starts_with("<config>"));
        assert_eq!(fetcher.requests(), vec!["https://x.org/a.imjoy.html"]);
    }

    #[tokio::test]
    async fn missing_and_empty_pages_are_errors() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://x.org/empty", "  ");
        assert!(matches!(
            fetcher.fetch_text("https://x.org/none").await,
            Err(FetchError::Status { status: 404 })
        ));
        assert!(matches!(
            fetcher.fetch_text("https://x.org/empty").await,
            Err(FetchError::EmptyBody)
        ));
    }

    #[test]
    fn cache_buster_keeps_existing_query() {
        assert_eq!(with_cache_buster("https://x.org/a?v=1"), "https://x.org/a?v=1");
        assert!(with_cache_buster("https://x.org/a").starts_with("https://x.org/a?"));
    }

    #[tokio::test]
    async fn fetch_json_reports_decode_errors() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("https://x.org/m.json", "not json");
        let result: Result<serde_json::Value, _> = fetch_json(&fetcher, "https://x.org/m.json").await;
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }
}
