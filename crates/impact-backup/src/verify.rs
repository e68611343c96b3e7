use std::{collections::BTreeMap, sync::Arc};

use impact_core::Document;
use impact_crypto::{DerivedKey, KeyManager, Purpose};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    error::{ArchiveError, FormatError},
    format::{self, Header},
    manifest::ArchiveManifest,
    store::ArchiveStore,
};

/// How much of the archive to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum VerifyDepth {
    /// Decrypt and parse everything, then cross-check the manifest.
    #[default]
    Full,
    /// Decrypt only the first `chunks` chunks.
    Prefix { chunks: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub archive_id: String,
    pub depth: VerifyDepth,
    pub checksum_ok: bool,
    pub decryptable: bool,
    /// `None` when the depth did not allow the cross-check.
    pub manifest_consistent: Option<bool>,
    /// Version named by the blob header, or the manifest's when the header
    /// could not be read.
    pub key_version: u32,
    pub issues: Vec<String>,
}

impl VerificationReport {
    pub fn is_healthy(&self) -> bool {
        self.checksum_ok && self.decryptable && self.manifest_consistent == Some(true)
    }
}

/// Read-only integrity checks over published archives.
#[derive(Clone)]
pub struct ArchiveVerifier {
    store: ArchiveStore,
    keys: Arc<KeyManager>,
}

impl ArchiveVerifier {
    pub fn new(store: ArchiveStore, keys: Arc<KeyManager>) -> Self {
        Self { store, keys }
    }

    /// Check an archive. Integrity problems are reported, not returned as
    /// errors; only a missing archive or unreadable manifest is an error.
    #[instrument(skip(self))]
    pub fn verify(&self, id: &str, depth: VerifyDepth) -> Result<VerificationReport, ArchiveError> {
        let manifest = self.store.load_manifest(id)?;
        let blob = self.store.read_blob(id)?;
        let mut report = VerificationReport {
            archive_id: manifest.archive_id.clone(),
            depth,
            checksum_ok: false,
            decryptable: false,
            manifest_consistent: None,
            key_version: manifest.encryption_key_version,
            issues: Vec::new(),
        };

        let actual = format::checksum(&blob);
        if actual != manifest.checksum {
            report.issues.push(format!(
                "checksum mismatch: manifest has {}, stored blob hashes to {actual}",
                manifest.checksum
            ));
            return Ok(finish(report));
        }
        report.checksum_ok = true;

        let header = match Header::parse(&blob) {
            Ok(header) => header,
            Err(err) => {
                report.issues.push(err.to_string());
                return Ok(finish(report));
            }
        };
        report.key_version = header.key_version;
        let key = match self
            .keys
            .derive_key(Purpose::BackupEncryption, Some(header.key_version))
        {
            Ok(key) => key,
            Err(err) => {
                report.issues.push(format!("backup key unavailable: {err}"));
                return Ok(finish(report));
            }
        };

        match depth {
            VerifyDepth::Full => match open_archive(&key, &blob) {
                Ok(contents) => {
                    report.decryptable = true;
                    let consistent =
                        cross_check(&manifest, &header, blob.len(), &contents, &mut report.issues);
                    report.manifest_consistent = Some(consistent);
                }
                Err(err) => report.issues.push(format!("cannot open archive: {err}")),
            },
            VerifyDepth::Prefix { chunks } => {
                match format::decrypt_stream(&key, &blob, Some(chunks.max(1)))
                    .and_then(|opened| format::decompress_prefix(&opened.plaintext))
                {
                    Ok(_) => report.decryptable = true,
                    Err(err) => report.issues.push(format!("cannot open archive prefix: {err}")),
                }
                let mut issues = Vec::new();
                check_envelope(&manifest, &header, blob.len(), &mut issues);
                if !issues.is_empty() {
                    report.manifest_consistent = Some(false);
                    report.issues.extend(issues);
                }
            }
        }
        Ok(finish(report))
    }
}

/// Decrypt, decompress and parse a whole archive blob.
pub(crate) fn open_archive(
    key: &DerivedKey,
    blob: &[u8],
) -> Result<BTreeMap<String, Vec<Document>>, FormatError> {
    let opened = format::decrypt_stream(key, blob, None)?;
    let container = format::decompress(&opened.plaintext)?;
    format::parse_container(&container)
}

fn check_envelope(
    manifest: &ArchiveManifest,
    header: &Header,
    blob_len: usize,
    issues: &mut Vec<String>,
) {
    if header.key_version != manifest.encryption_key_version {
        issues.push(format!(
            "manifest names key version {}, blob uses {}",
            manifest.encryption_key_version, header.key_version
        ));
    }
    if blob_len as u64 != manifest.size_bytes {
        issues.push(format!(
            "manifest size is {} bytes, blob is {blob_len}",
            manifest.size_bytes
        ));
    }
}

fn cross_check(
    manifest: &ArchiveManifest,
    header: &Header,
    blob_len: usize,
    contents: &BTreeMap<String, Vec<Document>>,
    issues: &mut Vec<String>,
) -> bool {
    let before = issues.len();
    check_envelope(manifest, header, blob_len, issues);

    for name in &manifest.collections {
        let expected = manifest.document_counts.get(name).copied();
        match (contents.get(name), expected) {
            (None, _) => issues.push(format!("collection {name} is missing from the archive")),
            (Some(_), None) => issues.push(format!("manifest has no count for {name}")),
            (Some(docs), Some(count)) if docs.len() as u64 != count => issues.push(format!(
                "collection {name}: manifest says {count} documents, archive holds {}",
                docs.len()
            )),
            _ => {}
        }
    }
    for name in contents.keys() {
        if !manifest.collections.contains(name) {
            issues.push(format!("archive holds unlisted collection {name}"));
        }
    }
    for name in manifest.document_counts.keys() {
        if !manifest.collections.contains(name) {
            issues.push(format!("manifest counts unlisted collection {name}"));
        }
    }
    issues.len() == before
}

fn finish(report: VerificationReport) -> VerificationReport {
    if report.is_healthy() {
        info!(target: "audit", archive_id = %report.archive_id, "archive verified");
    } else {
        warn!(
            target: "audit",
            archive_id = %report.archive_id,
            checksum_ok = report.checksum_ok,
            decryptable = report.decryptable,
            issues = report.issues.len(),
            "archive failed verification"
        );
    }
    report
}
