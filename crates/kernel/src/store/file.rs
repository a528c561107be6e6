//! Directory-backed document store.
//!
//! Each document is one JSON file named by the hex encoding of its id, so any
//! id (spaces, slashes, unicode) maps to a safe file name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::{Document, DocumentStore, StoreError, StoreFactory, next_rev};

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct FileStore {
    dir: PathBuf,
    // Serializes read-check-write sequences within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(backend)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(id.as_bytes())))
    }

    async fn read(&self, id: &str) -> Result<Option<Document>, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(backend),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(backend(e)),
        }
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        self.read(id)
            .await?
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn put(&self, mut doc: Document) -> Result<String, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read(&doc.id).await?.and_then(|d| d.rev);
        if current.is_some() && current != doc.rev {
            return Err(StoreError::Conflict { id: doc.id });
        }
        let rev = next_rev(current.as_deref(), &doc.body);
        doc.rev = Some(rev.clone());
        let bytes = serde_json::to_vec_pretty(&doc).map_err(backend)?;
        let path = self.path_for(&doc.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(backend)?;
        tokio::fs::rename(&tmp, &path).await.map_err(backend)?;
        Ok(rev)
    }

    async fn remove(&self, doc: &Document) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(existing) = self.read(&doc.id).await? else {
            return Err(StoreError::NotFound { id: doc.id.clone() });
        };
        if doc.rev.is_some() && existing.rev != doc.rev {
            return Err(StoreError::Conflict { id: doc.id.clone() });
        }
        tokio::fs::remove_file(self.path_for(&doc.id))
            .await
            .map_err(backend)
    }

    async fn all_docs(&self) -> Result<Vec<Document>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(backend)?;
        let mut docs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(backend)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(backend)?;
            match serde_json::from_slice::<Document>(&bytes) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable document"),
            }
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }
}

/// Opens `{root}/{name}` directories as stores.
#[derive(Clone)]
pub struct FileStoreFactory {
    root: PathBuf,
}

impl FileStoreFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StoreFactory for FileStoreFactory {
    async fn open(&self, name: &str) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let store = FileStore::open(self.root.join(name)).await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!(
            "plughost-store-{}",
            crate::plugin::descriptor::rand_id()
        ))
    }

    #[tokio::test]
    async fn documents_survive_reopening() {
        let root = temp_root();
        let factory = FileStoreFactory::new(&root);
        let store = factory.open("config").await.unwrap();
        let doc = Document::from_serializable("repository list", &json!({ "list": [] })).unwrap();
        let rev = store.put(doc).await.unwrap();

        let reopened = factory.open("config").await.unwrap();
        let loaded = reopened.get("repository list").await.unwrap();
        assert_eq!(loaded.rev.as_deref(), Some(rev.as_str()));
        assert_eq!(reopened.all_docs().await.unwrap().len(), 1);

        reopened.remove(&loaded).await.unwrap();
        assert!(reopened.get("repository list").await.unwrap_err().is_not_found());
        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn stale_revision_conflicts() {
        let root = temp_root();
        let store = FileStore::open(&root).await.unwrap();
        let doc = Document::from_serializable("a", &json!({ "n": 1 })).unwrap();
        store.put(doc.clone()).await.unwrap();
        let err = store.put(doc).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        tokio::fs::remove_dir_all(&root).await.ok();
    }
}
