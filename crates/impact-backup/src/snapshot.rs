use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use impact_core::{CancelToken, CollectionStore, Document, LiveDataGuard};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("no collections named for snapshot")]
    NoCollections,
    #[error("collection `{0}` named more than once")]
    DuplicateCollection(String),
    #[error("collection `{name}` unavailable: {reason}")]
    CollectionUnavailable { name: String, reason: String },
    #[error("snapshot cancelled")]
    Cancelled,
}

/// Documents of one collection exactly as read. Encrypted fields stay as
/// their stored ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot {
    pub name: String,
    pub documents: Vec<Document>,
}

impl CollectionSnapshot {
    pub fn count(&self) -> u64 {
        self.documents.len() as u64
    }
}

/// A complete, in-memory copy of the named collections.
#[derive(Debug, Clone)]
pub struct SnapshotHandle {
    taken_at: DateTime<Utc>,
    collections: Vec<CollectionSnapshot>,
}

impl SnapshotHandle {
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn collections(&self) -> &[CollectionSnapshot] {
        &self.collections
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&CollectionSnapshot> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Counts recorded as iterated; the manifest copies these.
    pub fn document_counts(&self) -> BTreeMap<String, u64> {
        self.collections
            .iter()
            .map(|c| (c.name.clone(), c.count()))
            .collect()
    }
}

/// Reads whole collections from the live store.
pub struct SnapshotBuilder<'a> {
    store: &'a dyn CollectionStore,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(store: &'a dyn CollectionStore) -> Self {
        Self { store }
    }

    /// Read every named collection. The guard proves the live-data lock is
    /// held, so no restore can interleave. Nothing is returned unless every
    /// collection was read.
    #[instrument(skip_all, fields(collections = names.len()))]
    pub async fn build(
        &self,
        guard: &LiveDataGuard,
        names: &[String],
        cancel: &CancelToken,
    ) -> Result<SnapshotHandle, SnapshotError> {
        if names.is_empty() {
            return Err(SnapshotError::NoCollections);
        }
        let mut seen = BTreeSet::new();
        if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(SnapshotError::DuplicateCollection(dup.clone()));
        }

        debug!(operation = guard.operation(), "building snapshot");
        let taken_at = Utc::now();
        let mut collections = Vec::with_capacity(names.len());
        for name in names {
            if cancel.is_cancelled() {
                return Err(SnapshotError::Cancelled);
            }
            let documents = self.store.read_all(name).await.map_err(|err| {
                SnapshotError::CollectionUnavailable {
                    name: name.clone(),
                    reason: err.to_string(),
                }
            })?;
            debug!(collection = %name, documents = documents.len(), "collection read");
            collections.push(CollectionSnapshot {
                name: name.clone(),
                documents,
            });
        }
        Ok(SnapshotHandle {
            taken_at,
            collections,
        })
    }
}

#[cfg(test)]
mod tests {
    use impact_core::{InMemoryStore, LiveDataLock};
    use serde_json::json;

    use super::*;
    use crate::testutil::doc;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn records_counts_for_every_collection() {
        let store = InMemoryStore::new()
            .with_collection("patients", vec![doc(json!({"patient_id": "P-1"}))])
            .with_collection("episodes", Vec::new());
        let lock = LiveDataLock::new();
        let guard = lock.acquire("backup").await;

        let snapshot = SnapshotBuilder::new(&store)
            .build(&guard, &names(&["patients", "episodes"]), &CancelToken::new())
            .await
            .expect("snapshot");
        assert_eq!(snapshot.names(), ["patients", "episodes"]);
        assert_eq!(snapshot.document_counts()["patients"], 1);
        assert_eq!(snapshot.get("episodes").expect("episodes").count(), 0);
    }

    #[tokio::test]
    async fn unknown_collection_aborts_the_build() {
        let store = InMemoryStore::new().with_collection("patients", Vec::new());
        let lock = LiveDataLock::new();
        let guard = lock.acquire("backup").await;

        let err = SnapshotBuilder::new(&store)
            .build(&guard, &names(&["patients", "tumours"]), &CancelToken::new())
            .await
            .expect_err("missing");
        assert!(matches!(err, SnapshotError::CollectionUnavailable { ref name, .. } if name == "tumours"));
    }

    #[tokio::test]
    async fn rejects_empty_and_duplicate_name_lists() {
        let store = InMemoryStore::new().with_collection("patients", Vec::new());
        let lock = LiveDataLock::new();
        let guard = lock.acquire("backup").await;
        let builder = SnapshotBuilder::new(&store);
        let cancel = CancelToken::new();

        assert_eq!(
            builder.build(&guard, &[], &cancel).await.expect_err("empty"),
            SnapshotError::NoCollections
        );
        assert_eq!(
            builder
                .build(&guard, &names(&["patients", "patients"]), &cancel)
                .await
                .expect_err("dup"),
            SnapshotError::DuplicateCollection("patients".into())
        );
    }

    #[tokio::test]
    async fn cancellation_is_honoured() {
        let store = InMemoryStore::new().with_collection("patients", Vec::new());
        let lock = LiveDataLock::new();
        let guard = lock.acquire("backup").await;
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = SnapshotBuilder::new(&store)
            .build(&guard, &names(&["patients"]), &cancel)
            .await
            .expect_err("cancelled");
        assert_eq!(err, SnapshotError::Cancelled);
    }
}
