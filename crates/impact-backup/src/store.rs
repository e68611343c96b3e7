use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{instrument, warn};

use crate::{
    error::{storage_err, ArchiveError},
    manifest::ArchiveManifest,
};

pub const BLOB_FILE: &str = "archive.bin";
pub const MANIFEST_FILE: &str = "manifest.json";
const STAGING_DIR: &str = ".staging";

/// Directory of archives, one subdirectory per archive id.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

/// A fully written archive directory not yet visible to readers. Dropping it
/// without publishing removes it.
#[derive(Debug)]
pub(crate) struct StagedArchive {
    id: String,
    dir: TempDir,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self, id: &str) -> Result<PathBuf, ArchiveError> {
        validate_id(id)?;
        Ok(self.root.join(id))
    }

    pub(crate) fn stage(
        &self,
        manifest: &ArchiveManifest,
        blob: &[u8],
    ) -> Result<StagedArchive, ArchiveError> {
        validate_id(&manifest.archive_id)?;
        let staging = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(storage_err)?;
        let dir = TempDir::new_in(&staging).map_err(storage_err)?;

        write_file(&dir.path().join(BLOB_FILE), blob)?;
        let json = serde_json::to_vec_pretty(manifest).map_err(storage_err)?;
        write_file(&dir.path().join(MANIFEST_FILE), &json)?;

        Ok(StagedArchive {
            id: manifest.archive_id.clone(),
            dir,
        })
    }

    /// Make a staged archive visible with a single rename.
    pub(crate) fn publish(&self, staged: StagedArchive) -> Result<PathBuf, ArchiveError> {
        let target = self.root.join(&staged.id);
        if target.exists() {
            return Err(ArchiveError::Storage(format!(
                "archive {} already exists",
                staged.id
            )));
        }
        fs::rename(staged.dir.path(), &target).map_err(storage_err)?;
        Ok(target)
    }

    /// Published archives, oldest first. Hidden directories and directories
    /// without a readable manifest are skipped.
    #[instrument(skip_all)]
    pub fn list(&self) -> Result<Vec<ArchiveManifest>, ArchiveError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err(err)),
        };

        let mut manifests = Vec::new();
        for entry in entries {
            let entry = entry.map_err(storage_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            match self.load_manifest(&name) {
                Ok(manifest) if manifest.archive_id == name => manifests.push(manifest),
                Ok(manifest) => warn!(
                    dir = %name,
                    archive_id = %manifest.archive_id,
                    "skipping archive whose manifest names another id"
                ),
                Err(err) => warn!(dir = %name, error = %err, "skipping unreadable archive"),
            }
        }
        manifests.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.archive_id.cmp(&b.archive_id))
        });
        Ok(manifests)
    }

    pub fn load_manifest(&self, id: &str) -> Result<ArchiveManifest, ArchiveError> {
        let path = self.archive_dir(id)?.join(MANIFEST_FILE);
        let bytes = read_file(&path, id)?;
        serde_json::from_slice(&bytes).map_err(|err| ArchiveError::Manifest {
            id: id.to_string(),
            reason: err.to_string(),
        })
    }

    pub fn read_blob(&self, id: &str) -> Result<Vec<u8>, ArchiveError> {
        let path = self.archive_dir(id)?.join(BLOB_FILE);
        read_file(&path, id)
    }

    /// Remove an archive. It is first renamed to a hidden directory, so a
    /// deletion interrupted halfway never leaves a listable archive.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<(), ArchiveError> {
        let dir = self.archive_dir(id)?;
        if !dir.is_dir() {
            return Err(ArchiveError::NotFound(id.to_string()));
        }
        let tomb = self.root.join(format!(".deleting-{id}"));
        fs::rename(&dir, &tomb).map_err(storage_err)?;
        fs::remove_dir_all(&tomb).map_err(storage_err)
    }

    /// Bytes used by published archives, manifests included.
    pub fn total_size(&self) -> Result<u64, ArchiveError> {
        let mut total = 0;
        for manifest in self.list()? {
            let dir = self.root.join(&manifest.archive_id);
            for file in [BLOB_FILE, MANIFEST_FILE] {
                total += fs::metadata(dir.join(file)).map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }
}

/// `YYYYMMDDTHHMMSSZ-<8 hex>`; sorts by creation time.
pub fn new_archive_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

fn validate_id(id: &str) -> Result<(), ArchiveError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ArchiveError::InvalidId(id.to_string()))
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
    let mut file = File::create(path).map_err(storage_err)?;
    file.write_all(bytes).map_err(storage_err)?;
    file.sync_all().map_err(storage_err)
}

fn read_file(path: &Path, id: &str) -> Result<Vec<u8>, ArchiveError> {
    fs::read(path).map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            ArchiveError::NotFound(id.to_string())
        } else {
            storage_err(err)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::manifest::ArchiveKind;

    fn manifest(id: &str, created_at: &str) -> ArchiveManifest {
        ArchiveManifest {
            archive_id: id.into(),
            created_at: created_at.parse().expect("timestamp"),
            kind: ArchiveKind::Automatic,
            collections: vec!["patients".into()],
            document_counts: BTreeMap::from([("patients".into(), 1)]),
            size_bytes: 4,
            checksum: String::new(),
            encryption_key_version: 1,
            note: None,
        }
    }

    #[test]
    fn staged_archive_is_invisible_until_published() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());

        let staged = store
            .stage(&manifest("20261019T120000Z-aaaaaaaa", "2026-10-19T12:00:00Z"), b"blob")
            .expect("stage");
        assert!(store.list().expect("list").is_empty());

        store.publish(staged).expect("publish");
        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(store.read_blob(&listed[0].archive_id).expect("blob"), b"blob");
    }

    #[test]
    fn dropped_stage_leaves_nothing_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        drop(
            store
                .stage(&manifest("20261019T120000Z-bbbbbbbb", "2026-10-19T12:00:00Z"), b"blob")
                .expect("stage"),
        );

        let leftovers = fs::read_dir(dir.path().join(STAGING_DIR)).expect("staging").count();
        assert_eq!(leftovers, 0);
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn list_skips_hidden_and_broken_directories_and_sorts_by_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        for (id, at) in [
            ("20261019T120000Z-00000002", "2026-10-19T12:00:00Z"),
            ("20261018T120000Z-00000001", "2026-10-18T12:00:00Z"),
        ] {
            let staged = store.stage(&manifest(id, at), b"x").expect("stage");
            store.publish(staged).expect("publish");
        }
        fs::create_dir_all(dir.path().join("junk")).expect("junk");
        fs::write(dir.path().join("junk").join(MANIFEST_FILE), "{").expect("junk manifest");
        fs::create_dir_all(dir.path().join(".deleting-old")).expect("hidden");

        let ids: Vec<_> = store.list().expect("list").into_iter().map(|m| m.archive_id).collect();
        assert_eq!(ids, ["20261018T120000Z-00000001", "20261019T120000Z-00000002"]);
    }

    #[test]
    fn delete_removes_archive_and_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArchiveStore::new(dir.path());
        let id = "20261019T120000Z-cccccccc";
        let staged = store.stage(&manifest(id, "2026-10-19T12:00:00Z"), b"x").expect("stage");
        store.publish(staged).expect("publish");
        assert!(store.total_size().expect("size") > 0);

        store.delete(id).expect("delete");
        assert!(store.list().expect("list").is_empty());
        assert!(matches!(store.delete(id), Err(ArchiveError::NotFound(_))));
    }

    #[test]
    fn ids_cannot_escape_the_root() {
        let store = ArchiveStore::new("/tmp/archives");
        for bad in ["", "..", "../etc", "a/b", ".staging"] {
            assert!(matches!(store.archive_dir(bad), Err(ArchiveError::InvalidId(_))), "{bad}");
        }
    }

    #[test]
    fn generated_ids_are_valid_and_time_prefixed() {
        let id = new_archive_id("2026-10-19T08:30:05Z".parse().expect("timestamp"));
        assert!(id.starts_with("20261019T083005Z-"));
        assert_eq!(id.len(), "20261019T083005Z-".len() + 8);
        assert!(validate_id(&id).is_ok());
    }
}
