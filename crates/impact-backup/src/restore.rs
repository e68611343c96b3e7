//! Restoring live collections from a verified archive.
//!
//! The live-data lock is held throughout. Order: confirm, verify, write a
//! safety archive of the current data, decrypt, then replace collection by
//! collection. A failure after the first replacement rolls the replaced
//! collections back from the in-memory safety snapshot and is reported as a
//! partial restore, never as success or a plain failure.

use std::{collections::BTreeMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use impact_core::{CancelToken, CollectionStore, Document, LiveDataGuard, LiveDataLock};
use impact_crypto::{KeyManager, Purpose};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::{
    error::ArchiveError,
    manifest::{ArchiveKind, ArchiveManifest},
    snapshot::{SnapshotBuilder, SnapshotHandle},
    verify::{open_archive, ArchiveVerifier, VerificationReport, VerifyDepth},
    writer::ArchiveWriter,
};

/// The exact text an operator must supply to restore `archive_id`.
pub fn confirmation_token_for(archive_id: &str) -> String {
    format!("RESTORE {archive_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreStep {
    Verify,
    SafetySnapshot,
    Decrypt,
    Replace,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreStep::Verify => "verify",
            RestoreStep::SafetySnapshot => "safety-snapshot",
            RestoreStep::Decrypt => "decrypt",
            RestoreStep::Replace => "replace",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionState {
    Replaced,
    NotReplaced,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionRestore {
    pub name: String,
    pub state: CollectionState,
    /// Live count before the restore; `None` when the collection was absent.
    pub before: Option<u64>,
    pub after: Option<u64>,
    /// Set when a replaced collection was put back to its pre-restore
    /// contents after a later failure.
    pub rolled_back: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CollectionRestore {
    pub fn was_replaced(&self) -> bool {
        self.state == CollectionState::Replaced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreOutcome {
    Completed,
    Partial,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub archive_id: String,
    pub started_at: DateTime<Utc>,
    pub outcome: RestoreOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_archive_id: Option<String>,
    pub collections: Vec<CollectionRestore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<RestoreStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RestoreReport {
    pub fn collection(&self, name: &str) -> Option<&CollectionRestore> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn replaced(&self) -> impl Iterator<Item = &CollectionRestore> {
        self.collections.iter().filter(|c| c.was_replaced())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Must equal [`confirmation_token_for`] the archive being restored.
    pub confirmation: String,
    /// Put already-replaced collections back when a later one fails.
    pub rollback_on_failure: bool,
}

impl RestoreOptions {
    pub fn confirmed(token: impl Into<String>) -> Self {
        Self {
            confirmation: token.into(),
            rollback_on_failure: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("restoring {archive_id} requires the confirmation token `RESTORE {archive_id}`")]
    ConfirmationRequired { archive_id: String },
    #[error("archive {archive_id} failed verification; live data untouched")]
    VerificationFailed {
        archive_id: String,
        report: Box<VerificationReport>,
    },
    /// Nothing live was replaced.
    #[error("restore failed at {step}: {reason}; live data untouched")]
    Failed {
        step: RestoreStep,
        reason: String,
        report: Box<RestoreReport>,
    },
    /// Some collections were replaced before the failure.
    #[error("restore only partially applied: {}", partial_summary(.report))]
    PartialRestore { report: Box<RestoreReport> },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl RestoreError {
    /// The report, for failures that carry one.
    pub fn report(&self) -> Option<&RestoreReport> {
        match self {
            RestoreError::Failed { report, .. } | RestoreError::PartialRestore { report } => {
                Some(&**report)
            }
            _ => None,
        }
    }
}

fn partial_summary(report: &RestoreReport) -> String {
    let replaced: Vec<&str> = report.replaced().map(|c| c.name.as_str()).collect();
    format!(
        "replaced [{}], error: {}",
        replaced.join(", "),
        report.error.as_deref().unwrap_or("unknown")
    )
}

/// Runs one restore against the live store.
pub struct RestoreCoordinator<'a> {
    live: &'a dyn CollectionStore,
    lock: &'a LiveDataLock,
    writer: &'a ArchiveWriter,
    verifier: &'a ArchiveVerifier,
    keys: Arc<KeyManager>,
}

impl<'a> RestoreCoordinator<'a> {
    pub fn new(
        live: &'a dyn CollectionStore,
        lock: &'a LiveDataLock,
        writer: &'a ArchiveWriter,
        verifier: &'a ArchiveVerifier,
        keys: Arc<KeyManager>,
    ) -> Self {
        Self {
            live,
            lock,
            writer,
            verifier,
            keys,
        }
    }

    #[instrument(skip(self, options, cancel))]
    pub async fn restore(
        &self,
        archive_id: &str,
        options: &RestoreOptions,
        cancel: &CancelToken,
    ) -> Result<RestoreReport, RestoreError> {
        if options.confirmation != confirmation_token_for(archive_id) {
            return Err(RestoreError::ConfirmationRequired {
                archive_id: archive_id.to_string(),
            });
        }
        let guard = self.lock.acquire("restore").await;
        info!(target: "audit", archive_id, "restore started");

        let verification = self.verifier.verify(archive_id, VerifyDepth::Full)?;
        if !verification.is_healthy() {
            warn!(target: "audit", archive_id, "restore refused: archive failed verification");
            return Err(RestoreError::VerificationFailed {
                archive_id: archive_id.to_string(),
                report: Box::new(verification),
            });
        }
        let manifest = self.writer.store().load_manifest(archive_id)?;

        let mut report = RestoreReport {
            archive_id: archive_id.to_string(),
            started_at: Utc::now(),
            outcome: RestoreOutcome::Aborted,
            verification: Some(verification),
            safety_archive_id: None,
            collections: manifest
                .collections
                .iter()
                .map(|name| CollectionRestore {
                    name: name.clone(),
                    state: CollectionState::NotReplaced,
                    before: None,
                    after: None,
                    rolled_back: false,
                    error: None,
                })
                .collect(),
            failed_step: None,
            error: None,
        };

        let safety = match self.safety_archive(&guard, &manifest, cancel).await {
            Ok(safety) => safety,
            Err(reason) => return Err(abort(report, RestoreStep::SafetySnapshot, reason)),
        };
        if let Some((snapshot, safety_manifest)) = &safety {
            report.safety_archive_id = Some(safety_manifest.archive_id.clone());
            for entry in &mut report.collections {
                entry.before = snapshot.get(&entry.name).map(|c| c.count());
            }
        }

        let mut contents = match self.decrypt(&manifest) {
            Ok(contents) => contents,
            Err(reason) => return Err(abort(report, RestoreStep::Decrypt, reason)),
        };

        for idx in 0..report.collections.len() {
            let name = report.collections[idx].name.clone();
            let result = if cancel.is_cancelled() {
                Err("restore cancelled".to_string())
            } else {
                let documents = contents.remove(&name).unwrap_or_default();
                self.live
                    .replace_all(&name, documents)
                    .await
                    .map_err(|e| e.to_string())
            };
            let entry = &mut report.collections[idx];
            match result {
                Ok(()) => {
                    entry.state = CollectionState::Replaced;
                    entry.after = self.live.count(&name).await.ok();
                    info!(collection = %name, before = ?entry.before, after = ?entry.after, "collection restored");
                }
                Err(reason) => {
                    if !cancel.is_cancelled() {
                        entry.state = CollectionState::Failed;
                    }
                    entry.error = Some(reason.clone());
                    if report.replaced().next().is_none() {
                        return Err(abort(report, RestoreStep::Replace, reason));
                    }
                    if options.rollback_on_failure {
                        self.roll_back(&mut report, safety.as_ref().map(|(s, _)| s))
                            .await;
                    }
                    report.outcome = RestoreOutcome::Partial;
                    report.failed_step = Some(RestoreStep::Replace);
                    report.error = Some(reason);
                    error!(
                        target: "audit",
                        archive_id,
                        failed_collection = %name,
                        "restore partially applied"
                    );
                    return Err(RestoreError::PartialRestore {
                        report: Box::new(report),
                    });
                }
            }
        }

        report.outcome = RestoreOutcome::Completed;
        info!(
            target: "audit",
            archive_id,
            collections = report.collections.len(),
            safety_archive = report.safety_archive_id.as_deref().unwrap_or("none"),
            "restore completed"
        );
        Ok(report)
    }

    /// Snapshot the live collections the restore will overwrite and write
    /// them as a manual archive. `None` when none of them exist yet.
    async fn safety_archive(
        &self,
        guard: &LiveDataGuard,
        manifest: &ArchiveManifest,
        cancel: &CancelToken,
    ) -> Result<Option<(SnapshotHandle, ArchiveManifest)>, String> {
        let live_names = self
            .live
            .list_collections()
            .await
            .map_err(|e| e.to_string())?;
        let existing: Vec<String> = manifest
            .collections
            .iter()
            .filter(|name| live_names.contains(name))
            .cloned()
            .collect();
        if existing.is_empty() {
            info!("no live collections to preserve; skipping safety archive");
            return Ok(None);
        }
        let snapshot = SnapshotBuilder::new(self.live)
            .build(guard, &existing, cancel)
            .await
            .map_err(|e| e.to_string())?;
        let note = format!(
            "pre-restore safety snapshot before restoring {}",
            manifest.archive_id
        );
        let safety = self
            .writer
            .write(&snapshot, ArchiveKind::Manual, Some(note), cancel)
            .map_err(|e| e.to_string())?;
        Ok(Some((snapshot, safety)))
    }

    fn decrypt(&self, manifest: &ArchiveManifest) -> Result<BTreeMap<String, Vec<Document>>, String> {
        let blob = self
            .writer
            .store()
            .read_blob(&manifest.archive_id)
            .map_err(|e| e.to_string())?;
        let key = self
            .keys
            .derive_key(Purpose::BackupEncryption, Some(manifest.encryption_key_version))
            .map_err(|e| e.to_string())?;
        let contents = open_archive(&key, &blob).map_err(|e| e.to_string())?;
        if let Some(missing) = manifest
            .collections
            .iter()
            .find(|name| !contents.contains_key(*name))
        {
            return Err(format!("collection {missing} is missing from the archive"));
        }
        Ok(contents)
    }

    async fn roll_back(&self, report: &mut RestoreReport, safety: Option<&SnapshotHandle>) {
        for entry in report.collections.iter_mut().filter(|c| c.was_replaced()) {
            // A collection absent before the restore is emptied.
            let original = safety
                .and_then(|s| s.get(&entry.name))
                .map(|c| c.documents.clone())
                .unwrap_or_default();
            match self.live.replace_all(&entry.name, original).await {
                Ok(()) => {
                    entry.rolled_back = true;
                    entry.after = self.live.count(&entry.name).await.ok();
                    warn!(collection = %entry.name, "collection rolled back");
                }
                Err(err) => {
                    error!(collection = %entry.name, error = %err, "rollback failed");
                    entry.error = Some(format!("rollback failed: {err}"));
                }
            }
        }
    }
}

fn abort(mut report: RestoreReport, step: RestoreStep, reason: String) -> RestoreError {
    warn!(target: "audit", archive_id = %report.archive_id, %step, %reason, "restore aborted");
    report.outcome = RestoreOutcome::Aborted;
    report.failed_step = Some(step);
    report.error = Some(reason.clone());
    RestoreError::Failed {
        step,
        reason,
        report: Box::new(report),
    }
}
