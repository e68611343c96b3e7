//! File-backed live datastore: one JSON array per collection.

use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use impact_core::{CollectionStore, Document, StoreError};
use tempfile::NamedTempFile;
use tracing::instrument;

/// Stores each collection as `<root>/<name>.json`. Replacements go through a
/// temp file and a rename, so a reader sees either the old or the new array.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, collection: &str) -> Result<PathBuf, StoreError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::Storage {
                reason: format!("invalid collection name `{collection}`"),
            });
        }
        Ok(self.root.join(format!("{collection}.json")))
    }
}

#[async_trait]
impl CollectionStore for JsonDirStore {
    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err(err)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry.map_err(storage_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn read_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let path = self.path_for(collection)?;
        let bytes = fs::read(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound {
                    collection: collection.to_string(),
                }
            } else {
                storage_err(err)
            }
        })?;
        serde_json::from_slice(&bytes).map_err(storage_err)
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        Ok(self.read_all(collection).await?.len() as u64)
    }

    #[instrument(skip(self, documents), fields(documents = documents.len()))]
    async fn replace_all(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        let path = self.path_for(collection)?;
        fs::create_dir_all(&self.root).map_err(storage_err)?;

        let mut tmp = NamedTempFile::new_in(&self.root).map_err(storage_err)?;
        let json = serde_json::to_vec_pretty(&documents).map_err(storage_err)?;
        tmp.write_all(&json).map_err(storage_err)?;
        tmp.flush().map_err(storage_err)?;
        tmp.persist(&path).map_err(|e| storage_err(e.error))?;
        Ok(())
    }
}

fn storage_err<E: ToString>(err: E) -> StoreError {
    StoreError::Storage {
        reason: err.to_string(),
    }
}
