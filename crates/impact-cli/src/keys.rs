//! Key version management commands.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use impact_core::Document;
use impact_crypto::{document_key_versions, KeyVersionInfo, Purpose};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::Config,
    render,
    storage::{self, Runtime},
};

pub fn status(rt: &Runtime, json: bool) -> Result<()> {
    let mut versions = Vec::new();
    for purpose in Purpose::ALL {
        versions.extend(rt.keys.versions(purpose)?);
    }
    render::emit(json, &versions, |list| {
        for v in list {
            println!(
                "{:<18} v{:<3} {:<8} created {}{}",
                v.purpose.as_str(),
                v.version,
                if v.current { "current" } else { "" },
                v.created_at.to_rfc3339(),
                v.retired_at
                    .map(|at| format!("  retired {}", at.to_rfc3339()))
                    .unwrap_or_default()
            );
        }
    })
}

#[derive(Debug, Serialize)]
struct Rotated {
    purpose: Purpose,
    version: u32,
}

pub fn rotate(rt: &Runtime, purpose: Purpose, json: bool) -> Result<()> {
    let version = rt.keys.rotate(purpose)?;
    render::emit(json, &Rotated { purpose, version }, |r| {
        println!("{} key is now v{}.", r.purpose, r.version);
        if r.purpose == Purpose::FieldEncryption {
            println!("Run `impact fields migrate <collection>` to move existing values forward.");
        }
    })
}

/// Retire `version` once nothing still references it. The live-data lock is
/// held from the reference scan through the retirement.
pub async fn retire(rt: &Runtime, purpose: Purpose, version: u32, json: bool) -> Result<()> {
    let _guard = rt.service.lock().acquire("keys-retire").await;
    let users = references(rt, purpose, version).await?;
    if !users.is_empty() {
        bail!(
            "{purpose} key v{version} is still used by: {}",
            users.into_iter().collect::<Vec<_>>().join(", ")
        );
    }
    rt.keys.retire(purpose, version)?;
    let retired: Vec<KeyVersionInfo> = rt
        .keys
        .versions(purpose)?
        .into_iter()
        .filter(|v| v.version == version)
        .collect();
    render::emit(json, &retired, |_| println!("Retired {purpose} key v{version}."))
}

/// Collections or archives that still depend on a key version. Field keys
/// are also looked up inside every readable archive, since restoring one
/// brings its ciphertext back.
async fn references(rt: &Runtime, purpose: Purpose, version: u32) -> Result<BTreeSet<String>> {
    let mut users = BTreeSet::new();
    match purpose {
        Purpose::FieldEncryption => {
            let live = rt.service.live();
            for collection in live.list_collections().await? {
                let docs = live
                    .read_all(&collection)
                    .await
                    .with_context(|| format!("scanning {collection}"))?;
                if uses_version(&docs, version) {
                    users.insert(format!("collection {collection}"));
                }
            }
            for manifest in rt.service.list()? {
                let contents = match rt.service.archive_documents(&manifest.archive_id) {
                    Ok(contents) => contents,
                    Err(err) => {
                        warn!(
                            archive_id = %manifest.archive_id,
                            error = %err,
                            "archive unreadable; not scanned"
                        );
                        continue;
                    }
                };
                if contents.values().any(|docs| uses_version(docs, version)) {
                    users.insert(format!("archive {}", manifest.archive_id));
                }
            }
        }
        Purpose::BackupEncryption => {
            for manifest in rt.service.list()? {
                if manifest.encryption_key_version == version {
                    users.insert(format!("archive {}", manifest.archive_id));
                }
            }
        }
    }
    Ok(users)
}

fn uses_version(docs: &[Document], version: u32) -> bool {
    docs.iter().any(|d| document_key_versions(d).contains(&version))
}

/// Create the keychain master secret if it does not exist yet.
pub fn provision(config: &Config) -> Result<()> {
    let source = storage::keyring_source(config);
    if source.provision()? {
        info!(target: "audit", "master secret provisioned");
        println!("Master secret created in the OS keychain.");
    } else {
        println!("Master secret already present; nothing changed.");
    }
    Ok(())
}
