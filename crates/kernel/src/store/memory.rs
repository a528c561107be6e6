//! In-process document store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Document, DocumentStore, StoreError, StoreFactory, next_rev};

/// Documents kept in a map, lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Document>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        self.docs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn put(&self, mut doc: Document) -> Result<String, StoreError> {
        let mut docs = self.docs.lock();
        let current = docs.get(&doc.id).and_then(|d| d.rev.clone());
        if current.is_some() && current != doc.rev {
            return Err(StoreError::Conflict { id: doc.id });
        }
        let rev = next_rev(current.as_deref(), &doc.body);
        doc.rev = Some(rev.clone());
        docs.insert(doc.id.clone(), doc);
        Ok(rev)
    }

    async fn remove(&self, doc: &Document) -> Result<(), StoreError> {
        let mut docs = self.docs.lock();
        let Some(existing) = docs.get(&doc.id) else {
            return Err(StoreError::NotFound { id: doc.id.clone() });
        };
        if doc.rev.is_some() && existing.rev != doc.rev {
            return Err(StoreError::Conflict { id: doc.id.clone() });
        }
        docs.remove(&doc.id);
        Ok(())
    }

    async fn all_docs(&self) -> Result<Vec<Document>, StoreError> {
        Ok(self.docs.lock().values().cloned().collect())
    }
}

/// Hands out one shared [`MemoryStore`] per name.
#[derive(Clone, Default)]
pub struct MemoryStoreFactory {
    stores: Arc<DashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store behind a name, if it was opened.
    pub fn store(&self, name: &str) -> Option<Arc<MemoryStore>> {
        self.stores.get(name).map(|s| Arc::clone(s.value()))
    }
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let store = self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone();
        Ok(store)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{get_optional, upsert};
    use serde_json::{Map, json};

    fn doc(id: &str, value: serde_json::Value) -> Document {
        Document::from_serializable(id, &value).unwrap()
    }

    #[tokio::test]
    async fn put_on_existing_id_needs_current_rev() {
        let store = MemoryStore::new();
        let rev = store.put(doc("a", json!({ "n": 1 }))).await.unwrap();

        let err = store.put(doc("a", json!({ "n": 2 }))).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let mut update = doc("a", json!({ "n": 2 }));
        update.rev = Some(rev);
        store.put(update).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().field("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn upsert_rereads_rev() {
        let store = MemoryStore::new();
        upsert(&store, doc("a", json!({ "n": 1 }))).await.unwrap();
        let rev = upsert(&store, doc("a", json!({ "n": 2 }))).await.unwrap();
        assert!(rev.starts_with("2-"));
    }

    #[tokio::test]
    async fn not_found_is_distinct() {
        let store = MemoryStore::new();
        assert!(get_optional(&store, "missing").await.unwrap().is_none());
        let err = store
            .remove(&Document::new("missing", Map::new()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn factory_shares_stores_by_name() {
        let factory = MemoryStoreFactory::new();
        let a = factory.open("default_workspace").await.unwrap();
        a.put(doc("x", json!({}))).await.unwrap();
        let again = factory.open("default_workspace").await.unwrap();
        assert_eq!(again.all_docs().await.unwrap().len(), 1);
        assert_eq!(factory.store("default_workspace").unwrap().len(), 1);
    }
}
