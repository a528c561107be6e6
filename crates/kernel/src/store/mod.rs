//! Document store abstraction.
//!
//! The host persists its repository list, workspace list, plugin settings, and
//! installed plugins as JSON documents keyed by `_id`. Writes use revision-based
//! optimistic concurrency: a `put` on an existing id must carry the current
//! `_rev`, otherwise it fails with [`StoreError::Conflict`]. Callers that just
//! want "write this" use [`upsert`], which re-reads `_rev` first.
//!
//! "Not found" is an expected outcome and has its own variant, see
//! [`get_optional`].

mod file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use file::{FileStore, FileStoreFactory};
pub use memory::{MemoryStore, MemoryStoreFactory};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document '{id}' not found")]
    NotFound { id: String },

    #[error("document '{id}' was modified concurrently (revision conflict)")]
    Conflict { id: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A stored JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            body,
        }
    }

    /// Build a document from any serializable object value.
    pub fn from_serializable<T: Serialize>(id: impl Into<String>, value: &T) -> Result<Self, StoreError> {
        let id = id.into();
        match serde_json::to_value(value) {
            Ok(Value::Object(mut body)) => {
                body.remove("_id");
                let rev = body.remove("_rev").and_then(|r| r.as_str().map(str::to_string));
                Ok(Self { id, rev, body })
            }
            Ok(other) => Err(StoreError::Backend(format!(
                "document '{id}' must be a JSON object, got {other}"
            ))),
            Err(e) => Err(StoreError::Backend(format!("document '{id}': {e}"))),
        }
    }

    /// Deserialize the whole document, `_id` included.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        let mut body = self.body.clone();
        body.insert("_id".to_string(), Value::String(self.id.clone()));
        serde_json::from_value(Value::Object(body))
            .map_err(|e| StoreError::Backend(format!("document '{}': {e}", self.id)))
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

/// Next revision string for a document body: `{generation}-{digest}`.
pub(crate) fn next_rev(previous: Option<&str>, body: &Map<String, Value>) -> String {
    let generation = previous
        .and_then(|r| r.split_once('-'))
        .and_then(|(n, _)| n.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let digest = hex::encode(Sha256::digest(&bytes));
    format!("{generation}-{}", &digest[..16])
}

/// Key-value document store with revision checks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Document, StoreError>;

    /// Write a document and return its new revision.
    async fn put(&self, doc: Document) -> Result<String, StoreError>;

    /// Delete a document. The revision must match when one is given.
    async fn remove(&self, doc: &Document) -> Result<(), StoreError>;

    async fn all_docs(&self) -> Result<Vec<Document>, StoreError>;
}

/// Opens named stores (the config store, one store per workspace).
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

/// `get` that turns "not found" into `None`.
pub async fn get_optional(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Option<Document>, StoreError> {
    match store.get(id).await {
        Ok(doc) => Ok(Some(doc)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a document, re-reading the current revision first.
pub async fn upsert(store: &dyn DocumentStore, mut doc: Document) -> Result<String, StoreError> {
    doc.rev = get_optional(store, &doc.id).await?.and_then(|d| d.rev);
    store.put(doc).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_serializable_lifts_id_and_rev() {
        let doc = Document::from_serializable(
            "x",
            &json!({ "_id": "ignored", "_rev": "3-abc", "list": [1, 2] }),
        )
        .unwrap();
        assert_eq!(doc.id, "x");
        assert_eq!(doc.rev.as_deref(), Some("3-abc"));
        assert_eq!(doc.field("list"), Some(&json!([1, 2])));
        assert!(Document::from_serializable("y", &json!([1])).is_err());
    }

    #[test]
    fn revisions_increase_generation() {
        let body = Map::new();
        let first = next_rev(None, &body);
        assert!(first.starts_with("1-"));
        assert!(next_rev(Some(&first), &body).starts_with("2-"));
    }

    #[test]
    fn decode_includes_id() {
        let mut body = Map::new();
        body.insert("list".into(), json!(["default"]));
        let doc = Document::new("workspace_list", body);
        let value: Value = doc.decode().unwrap();
        assert_eq!(value["_id"], "workspace_list");
    }
}
