//! One entry point per operator action. Every call returns a serializable
//! report so the CLI, a scheduler or an admin UI can render it uniformly.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use impact_core::{CancelToken, CollectionStore, Document, LiveDataLock};
use impact_crypto::{KeyError, KeyManager, Purpose};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    error::ArchiveError,
    manifest::{ArchiveKind, ArchiveManifest},
    restore::{RestoreCoordinator, RestoreError, RestoreOptions, RestoreReport},
    retention::{
        PolicyError, RetentionCandidate, RetentionDecision, RetentionPlanner, RetentionPolicy,
    },
    snapshot::SnapshotBuilder,
    space::SpaceProbe,
    store::ArchiveStore,
    verify::{open_archive, ArchiveVerifier, VerificationReport, VerifyDepth},
    writer::{ArchiveWriter, WriterOptions},
};

/// Collections snapshotted when none are configured.
pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "patients",
    "episodes",
    "treatments",
    "tumours",
    "investigations",
    "audit_logs",
    "users",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub archive_root: PathBuf,
    pub collections: Vec<String>,
    pub retention: RetentionPolicy,
    pub writer: WriterOptions,
}

impl BackupConfig {
    pub fn new(archive_root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: archive_root.into(),
            collections: DEFAULT_COLLECTIONS.iter().map(|s| s.to_string()).collect(),
            retention: RetentionPolicy::default(),
            writer: WriterOptions::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error("invalid retention policy: {0}")]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("archive {0} is manual; deleting it requires force")]
    ManualArchive(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionPlan {
    pub generated_at: DateTime<Utc>,
    pub policy: RetentionPolicy,
    pub keep: usize,
    pub prune: usize,
    pub decisions: Vec<RetentionDecision>,
}

impl RetentionPlan {
    pub fn prune_ids(&self) -> Vec<String> {
        self.decisions
            .iter()
            .filter(|d| !d.keep)
            .map(|d| d.archive_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneRefusal {
    pub archive_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub refused: Vec<PruneRefusal>,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub archive_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: ArchiveKind,
    pub size_bytes: u64,
}

impl From<&ArchiveManifest> for ArchiveSummary {
    fn from(m: &ArchiveManifest) -> Self {
        Self {
            archive_id: m.archive_id.clone(),
            created_at: m.created_at,
            kind: m.kind,
            size_bytes: m.size_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub archive_root: PathBuf,
    pub archive_count: usize,
    pub manual_count: usize,
    pub total_bytes: u64,
    /// `None` when the volume could not be queried.
    pub available_bytes: Option<u64>,
    pub latest: Option<ArchiveSummary>,
    /// Current key version per purpose.
    pub key_versions: BTreeMap<String, u32>,
}

/// Wires the backup components around one live store and one lock.
pub struct BackupService {
    live: Arc<dyn CollectionStore>,
    lock: LiveDataLock,
    keys: Arc<KeyManager>,
    space: Arc<dyn SpaceProbe>,
    writer: ArchiveWriter,
    verifier: ArchiveVerifier,
    planner: RetentionPlanner,
    collections: Vec<String>,
}

impl BackupService {
    pub fn new(
        config: BackupConfig,
        live: Arc<dyn CollectionStore>,
        keys: Arc<KeyManager>,
        space: Arc<dyn SpaceProbe>,
    ) -> Result<Self, ServiceError> {
        let planner = RetentionPlanner::new(config.retention)?;
        let store = ArchiveStore::new(config.archive_root);
        let writer = ArchiveWriter::new(store.clone(), keys.clone(), space.clone(), config.writer);
        let verifier = ArchiveVerifier::new(store, keys.clone());
        Ok(Self {
            live,
            lock: LiveDataLock::new(),
            keys,
            space,
            writer,
            verifier,
            planner,
            collections: config.collections,
        })
    }

    /// Share a lock with other users of the same live data.
    pub fn with_lock(mut self, lock: LiveDataLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn store(&self) -> &ArchiveStore {
        self.writer.store()
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn live(&self) -> &dyn CollectionStore {
        self.live.as_ref()
    }

    pub fn lock(&self) -> &LiveDataLock {
        &self.lock
    }

    #[instrument(skip(self, note, cancel))]
    pub async fn backup(
        &self,
        kind: ArchiveKind,
        note: Option<String>,
        cancel: &CancelToken,
    ) -> Result<ArchiveManifest, ServiceError> {
        let guard = self.lock.acquire("backup").await;
        let snapshot = SnapshotBuilder::new(self.live.as_ref())
            .build(&guard, &self.collections, cancel)
            .await
            .map_err(ArchiveError::from)?;
        Ok(self.writer.write(&snapshot, kind, note, cancel)?)
    }

    pub fn verify(&self, id: &str, depth: VerifyDepth) -> Result<VerificationReport, ServiceError> {
        Ok(self.verifier.verify(id, depth)?)
    }

    pub fn plan(&self, now: DateTime<Utc>) -> Result<RetentionPlan, ServiceError> {
        let candidates: Vec<RetentionCandidate> =
            self.store().list()?.iter().map(RetentionCandidate::from).collect();
        let decisions = self.planner.plan(&candidates, now);
        let keep = decisions.iter().filter(|d| d.keep).count();
        Ok(RetentionPlan {
            generated_at: now,
            policy: self.planner.policy().clone(),
            keep,
            prune: decisions.len() - keep,
            decisions,
        })
    }

    /// Delete the given automatic archives. Manual and unknown ids are
    /// refused individually; the rest still proceed.
    #[instrument(skip_all, fields(requested = ids.len()))]
    pub fn prune(&self, ids: &[String]) -> Result<PruneReport, ServiceError> {
        let mut report = PruneReport::default();
        for id in ids {
            let manifest = match self.store().load_manifest(id) {
                Ok(manifest) => manifest,
                Err(err) => {
                    report.refused.push(PruneRefusal {
                        archive_id: id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if manifest.kind == ArchiveKind::Manual {
                report.refused.push(PruneRefusal {
                    archive_id: id.clone(),
                    reason: "manual archives are never pruned".into(),
                });
                continue;
            }
            match self.store().delete(id) {
                Ok(()) => {
                    info!(target: "audit", archive_id = %id, "archive pruned");
                    report.freed_bytes += manifest.size_bytes;
                    report.deleted.push(id.clone());
                }
                Err(err) => {
                    warn!(archive_id = %id, error = %err, "prune failed");
                    report.refused.push(PruneRefusal {
                        archive_id: id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Delete one archive; manual archives only with `force`.
    pub fn delete(&self, id: &str, force: bool) -> Result<ArchiveManifest, ServiceError> {
        let manifest = self.store().load_manifest(id)?;
        if manifest.kind == ArchiveKind::Manual && !force {
            return Err(ServiceError::ManualArchive(id.to_string()));
        }
        self.store().delete(id)?;
        info!(target: "audit", archive_id = %id, kind = %manifest.kind, force, "archive deleted");
        Ok(manifest)
    }

    pub async fn restore(
        &self,
        id: &str,
        options: &RestoreOptions,
        cancel: &CancelToken,
    ) -> Result<RestoreReport, ServiceError> {
        let coordinator = RestoreCoordinator::new(
            self.live.as_ref(),
            &self.lock,
            &self.writer,
            &self.verifier,
            self.keys.clone(),
        );
        Ok(coordinator.restore(id, options, cancel).await?)
    }

    /// Decrypt an archive and return its collections. Nothing is written.
    pub fn archive_documents(
        &self,
        id: &str,
    ) -> Result<BTreeMap<String, Vec<Document>>, ServiceError> {
        let manifest = self.store().load_manifest(id)?;
        let blob = self.store().read_blob(id)?;
        let key = self
            .keys
            .derive_key(Purpose::BackupEncryption, Some(manifest.encryption_key_version))?;
        Ok(open_archive(&key, &blob).map_err(ArchiveError::from)?)
    }

    pub fn list(&self) -> Result<Vec<ArchiveManifest>, ServiceError> {
        Ok(self.store().list()?)
    }

    pub fn status(&self) -> Result<StatusReport, ServiceError> {
        let archives = self.store().list()?;
        let available_bytes = match self.space.available_bytes(self.store().root()) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(error = %err, "could not query free space");
                None
            }
        };
        let mut key_versions = BTreeMap::new();
        for purpose in Purpose::ALL {
            key_versions.insert(purpose.to_string(), self.keys.current_version(purpose)?);
        }
        Ok(StatusReport {
            archive_root: self.store().root().to_path_buf(),
            archive_count: archives.len(),
            manual_count: archives
                .iter()
                .filter(|m| m.kind == ArchiveKind::Manual)
                .count(),
            total_bytes: self.store().total_size()?,
            available_bytes,
            latest: archives.last().map(ArchiveSummary::from),
            key_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Duration;
    use impact_core::InMemoryStore;
    use serde_json::json;

    use super::*;
    use crate::{
        live_store::JsonDirStore,
        restore::confirmation_token_for,
        space::FixedSpace,
        store::BLOB_FILE,
        testutil::{doc, keys},
    };

    struct Setup {
        dir: tempfile::TempDir,
        service: BackupService,
    }

    async fn setup(available: u64) -> Setup {
        let dir = tempfile::tempdir().expect("tempdir");
        let live = JsonDirStore::new(dir.path().join("live"));
        live.replace_all(
            "patients",
            vec![doc(json!({"patient_id": "P-1"})), doc(json!({"patient_id": "P-2"}))],
        )
        .await
        .expect("seed patients");
        live.replace_all("episodes", vec![doc(json!({"episode_id": "E-1"}))])
            .await
            .expect("seed episodes");

        let mut config = BackupConfig::new(dir.path().join("archives"));
        config.collections = vec!["patients".into(), "episodes".into()];
        config.writer = WriterOptions {
            min_free_bytes: 1024,
            chunk_size: 256,
        };
        let service =
            BackupService::new(config, Arc::new(live), keys(), Arc::new(FixedSpace(available)))
                .expect("service");
        Setup { dir, service }
    }

    #[tokio::test]
    async fn backup_then_list_verify_and_status() {
        let s = setup(u64::MAX).await;
        let manifest = s
            .service
            .backup(ArchiveKind::Automatic, None, &CancelToken::new())
            .await
            .expect("backup");

        assert_eq!(s.service.list().expect("list"), vec![manifest.clone()]);
        assert!(s
            .service
            .verify(&manifest.archive_id, VerifyDepth::Full)
            .expect("verify")
            .is_healthy());

        let status = s.service.status().expect("status");
        assert_eq!(status.archive_count, 1);
        assert_eq!(status.manual_count, 0);
        assert!(status.total_bytes >= manifest.size_bytes);
        assert_eq!(status.latest.map(|l| l.archive_id), Some(manifest.archive_id));
        assert_eq!(status.key_versions["backup-encryption"], 1);
    }

    #[tokio::test]
    async fn corrupted_archive_fails_verification_and_cannot_be_restored() {
        let s = setup(u64::MAX).await;
        let manifest = s
            .service
            .backup(ArchiveKind::Automatic, None, &CancelToken::new())
            .await
            .expect("backup");
        let blob_path = s
            .service
            .store()
            .archive_dir(&manifest.archive_id)
            .expect("dir")
            .join(BLOB_FILE);
        let mut blob = fs::read(&blob_path).expect("blob");
        blob[40] ^= 0x80;
        fs::write(&blob_path, blob).expect("corrupt");

        let report = s
            .service
            .verify(&manifest.archive_id, VerifyDepth::Full)
            .expect("verify");
        assert!(!report.checksum_ok);

        let err = s
            .service
            .restore(
                &manifest.archive_id,
                &RestoreOptions::confirmed(confirmation_token_for(&manifest.archive_id)),
                &CancelToken::new(),
            )
            .await
            .expect_err("refused");
        assert!(matches!(
            err,
            ServiceError::Restore(RestoreError::VerificationFailed { .. })
        ));
        assert_eq!(s.service.live().count("patients").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn restore_brings_back_archived_contents() {
        let s = setup(u64::MAX).await;
        let manifest = s
            .service
            .backup(ArchiveKind::Automatic, None, &CancelToken::new())
            .await
            .expect("backup");
        s.service
            .live()
            .replace_all("patients", Vec::new())
            .await
            .expect("wipe");

        let report = s
            .service
            .restore(
                &manifest.archive_id,
                &RestoreOptions::confirmed(confirmation_token_for(&manifest.archive_id)),
                &CancelToken::new(),
            )
            .await
            .expect("restore");
        assert_eq!(s.service.live().count("patients").await.expect("count"), 2);
        assert_eq!(s.service.list().expect("list").len(), 2);
        assert!(report.safety_archive_id.is_some());
    }

    #[tokio::test]
    async fn archive_documents_reads_back_without_touching_live_data() {
        let s = setup(u64::MAX).await;
        let manifest = s
            .service
            .backup(ArchiveKind::Automatic, None, &CancelToken::new())
            .await
            .expect("backup");
        s.service
            .live()
            .replace_all("patients", Vec::new())
            .await
            .expect("wipe");

        let contents = s
            .service
            .archive_documents(&manifest.archive_id)
            .expect("open");
        assert_eq!(contents["patients"].len(), 2);
        assert_eq!(contents["episodes"][0]["episode_id"], json!("E-1"));
        assert_eq!(s.service.live().count("patients").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn insufficient_space_leaves_no_archive() {
        let s = setup(10).await;
        let err = s
            .service
            .backup(ArchiveKind::Automatic, None, &CancelToken::new())
            .await
            .expect_err("no space");
        assert!(matches!(
            err,
            ServiceError::Archive(ArchiveError::InsufficientSpace { .. })
        ));
        assert!(s.service.list().expect("list").is_empty());
        assert_eq!(s.service.status().expect("status").available_bytes, Some(10));
    }

    #[tokio::test]
    async fn missing_collection_fails_the_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = BackupService::new(
            BackupConfig::new(dir.path()),
            Arc::new(InMemoryStore::new().with_collection("patients", Vec::new())),
            keys(),
            Arc::new(FixedSpace(u64::MAX)),
        )
        .expect("service");
        let err = service
            .backup(ArchiveKind::Automatic, None, &CancelToken::new())
            .await
            .expect_err("episodes missing");
        assert!(matches!(err, ServiceError::Archive(ArchiveError::Snapshot(_))));
        assert!(service.list().expect("list").is_empty());
    }

    #[tokio::test]
    async fn prune_refuses_manual_and_unknown_archives() {
        let s = setup(u64::MAX).await;
        let cancel = CancelToken::new();
        let auto = s
            .service
            .backup(ArchiveKind::Automatic, None, &cancel)
            .await
            .expect("auto");
        let manual = s
            .service
            .backup(ArchiveKind::Manual, Some("keep".into()), &cancel)
            .await
            .expect("manual");

        let report = s
            .service
            .prune(&[
                auto.archive_id.clone(),
                manual.archive_id.clone(),
                "20200101T000000Z-00000000".into(),
            ])
            .expect("prune");
        assert_eq!(report.deleted, vec![auto.archive_id]);
        assert_eq!(report.freed_bytes, auto.size_bytes);
        assert_eq!(report.refused.len(), 2);
        assert_eq!(report.refused[0].archive_id, manual.archive_id);

        assert!(matches!(
            s.service.delete(&manual.archive_id, false),
            Err(ServiceError::ManualArchive(_))
        ));
        s.service.delete(&manual.archive_id, true).expect("forced delete");
        assert!(s.service.list().expect("list").is_empty());
    }

    #[tokio::test]
    async fn plan_counts_keep_and_prune() {
        let s = setup(u64::MAX).await;
        s.service
            .backup(ArchiveKind::Automatic, None, &CancelToken::new())
            .await
            .expect("backup");

        let fresh = s.service.plan(Utc::now()).expect("plan");
        assert_eq!((fresh.keep, fresh.prune), (1, 0));

        let later = s.service.plan(Utc::now() + Duration::days(500)).expect("plan");
        assert_eq!((later.keep, later.prune), (0, 1));
        assert_eq!(later.prune_ids().len(), 1);
        assert!(s.dir.path().join("archives").is_dir());
    }
}
