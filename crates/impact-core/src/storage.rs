use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;

/// One record of a collection. Keys are kept sorted, which makes the JSON
/// representation canonical.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Errors produced by live collection stores.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Requested collection does not exist.
    #[error("collection not found: {collection}")]
    NotFound { collection: String },
    /// Underlying storage failure.
    #[error("storage failure: {reason}")]
    Storage { reason: String },
}

/// Access to the primary datastore, one named collection at a time.
///
/// `read_all` must return the collection as of a single instant; stores that
/// cannot guarantee that must serialise writers themselves.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Names of every collection currently present.
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// All documents of a collection.
    async fn read_all(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    /// Number of documents in a collection.
    async fn count(&self, collection: &str) -> Result<u64, StoreError>;

    /// Replace a collection's contents wholesale, creating it if missing.
    async fn replace_all(&self, collection: &str, documents: Vec<Document>)
        -> Result<(), StoreError>;
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<BTreeMap<String, Vec<Document>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a collection; consumes and returns the store for chaining.
    pub fn with_collection(self, name: impl Into<String>, documents: Vec<Document>) -> Self {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(name.into(), documents);
        }
        self
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<Document>>>, StoreError> {
        self.inner.lock().map_err(|err| StoreError::Storage {
            reason: format!("lock poisoned: {err}"),
        })
    }
}

#[async_trait]
impl CollectionStore for InMemoryStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    async fn read_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.lock()?
            .get(collection)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
            })
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        self.lock()?
            .get(collection)
            .map(|docs| docs.len() as u64)
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
            })
    }

    async fn replace_all(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        self.lock()?.insert(collection.to_string(), documents);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(id: &str) -> Document {
        match json!({ "patient_id": id }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn replace_then_read_returns_new_contents() {
        let store = InMemoryStore::new().with_collection("patients", vec![doc("P-1")]);
        store
            .replace_all("patients", vec![doc("P-2"), doc("P-3")])
            .await
            .expect("replace");

        let docs = store.read_all("patients").await.expect("read");
        assert_eq!(docs, vec![doc("P-2"), doc("P-3")]);
        assert_eq!(store.count("patients").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn missing_collection_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.read_all("episodes").await.expect_err("should be missing");
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.count("episodes").await.is_err());
    }

    #[tokio::test]
    async fn lists_collections_sorted() {
        let store = InMemoryStore::new()
            .with_collection("treatments", Vec::new())
            .with_collection("episodes", Vec::new());
        assert_eq!(
            store.list_collections().await.expect("list"),
            vec!["episodes".to_string(), "treatments".to_string()]
        );
    }
}
