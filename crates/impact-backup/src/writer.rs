use std::{fs, sync::Arc};

use chrono::Utc;
use impact_core::CancelToken;
use impact_crypto::{KeyManager, Purpose};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    error::{storage_err, ArchiveError},
    format,
    manifest::{ArchiveKind, ArchiveManifest},
    snapshot::SnapshotHandle,
    space::SpaceProbe,
    store::{new_archive_id, ArchiveStore},
};

/// Room reserved for `manifest.json` in the space check.
const MANIFEST_ALLOWANCE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// Free space that must remain after the archive is written.
    pub min_free_bytes: u64,
    /// Plaintext bytes per encrypted chunk.
    pub chunk_size: u32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            min_free_bytes: 5 * 1024 * 1024 * 1024,
            chunk_size: 1024 * 1024,
        }
    }
}

/// Turns a snapshot into a published archive, or into nothing at all.
pub struct ArchiveWriter {
    store: ArchiveStore,
    keys: Arc<KeyManager>,
    space: Arc<dyn SpaceProbe>,
    options: WriterOptions,
}

impl ArchiveWriter {
    pub fn new(
        store: ArchiveStore,
        keys: Arc<KeyManager>,
        space: Arc<dyn SpaceProbe>,
        options: WriterOptions,
    ) -> Self {
        Self {
            store,
            keys,
            space,
            options,
        }
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    /// Serialize, compress and encrypt the snapshot under the current
    /// backup key, then publish it with its manifest. The archive is built in
    /// memory and the space check happens before anything touches disk; on
    /// any failure, cancellation included, no archive becomes visible.
    #[instrument(skip_all, fields(%kind))]
    pub fn write(
        &self,
        snapshot: &SnapshotHandle,
        kind: ArchiveKind,
        note: Option<String>,
        cancel: &CancelToken,
    ) -> Result<ArchiveManifest, ArchiveError> {
        let created_at = Utc::now();
        let archive_id = new_archive_id(created_at);
        let key = self
            .keys
            .derive_key(Purpose::BackupEncryption, None)
            .map_err(|e| ArchiveError::EncryptionFailure(e.to_string()))?;

        let container =
            format::build_container(snapshot.collections(), created_at.timestamp(), cancel)?;
        let compressed = format::compress(&container)?;
        drop(container);
        let blob = format::encrypt_stream(&key, &compressed, self.options.chunk_size, cancel)?;
        let key_version = key.version();
        drop(key);

        let manifest = ArchiveManifest {
            archive_id,
            created_at,
            kind,
            collections: snapshot.names(),
            document_counts: snapshot.document_counts(),
            size_bytes: blob.len() as u64,
            checksum: format::checksum(&blob),
            encryption_key_version: key_version,
            note,
        };

        self.ensure_space(manifest.size_bytes + MANIFEST_ALLOWANCE)?;
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let staged = self.store.stage(&manifest, &blob)?;
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        self.store.publish(staged)?;

        info!(
            target: "audit",
            archive_id = %manifest.archive_id,
            kind = %manifest.kind,
            documents = manifest.total_documents(),
            size_bytes = manifest.size_bytes,
            key_version = manifest.encryption_key_version,
            "archive written"
        );
        Ok(manifest)
    }

    fn ensure_space(&self, archive_bytes: u64) -> Result<(), ArchiveError> {
        fs::create_dir_all(self.store.root()).map_err(storage_err)?;
        let available = self
            .space
            .available_bytes(self.store.root())
            .map_err(storage_err)?;
        let required = archive_bytes.saturating_add(self.options.min_free_bytes);
        if available < required {
            warn!(required, available, "not enough space for archive");
            return Err(ArchiveError::InsufficientSpace {
                required,
                available,
            });
        }
        Ok(())
    }
}
