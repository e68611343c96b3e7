//! Backup, verify, retention and restore commands.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use impact_backup::{
    ArchiveKind, ArchiveManifest, RestoreError, RestoreOptions, RestoreReport, ServiceError,
    VerificationReport, VerifyDepth,
};
use impact_core::CancelToken;

use crate::{
    render::{self, bytes, yes_no},
    storage::Runtime,
};

pub async fn backup(
    rt: &Runtime,
    manual: bool,
    note: Option<String>,
    cancel: &CancelToken,
    json: bool,
) -> Result<()> {
    let kind = if manual {
        ArchiveKind::Manual
    } else {
        ArchiveKind::Automatic
    };
    let manifest = rt
        .service
        .backup(kind, note, cancel)
        .await
        .context("backup failed")?;
    render::emit(json, &manifest, |m| {
        println!("Archive {} written ({}).", m.archive_id, m.kind);
        print_manifest_body(m);
    })
}

pub fn verify(rt: &Runtime, id: &str, prefix_chunks: Option<u32>, json: bool) -> Result<()> {
    let depth = match prefix_chunks.or(rt.verify_prefix_chunks) {
        Some(chunks) => VerifyDepth::Prefix { chunks },
        None => VerifyDepth::Full,
    };
    let report = rt.service.verify(id, depth)?;
    render::emit(json, &report, print_verification)?;
    if !report.checksum_ok || !report.decryptable || report.manifest_consistent == Some(false) {
        bail!("archive {id} failed verification");
    }
    Ok(())
}

pub fn plan(rt: &Runtime, json: bool) -> Result<()> {
    let plan = rt.service.plan(Utc::now())?;
    render::emit(json, &plan, |p| {
        for d in &p.decisions {
            println!(
                "{:<28} {:<6} {:<8} {:<9} {}",
                d.archive_id,
                if d.keep { "keep" } else { "prune" },
                format!("{:?}", d.bucket).to_lowercase(),
                d.bucket_key.as_deref().unwrap_or("-"),
                d.reason.as_str()
            );
        }
        println!("{} kept, {} to prune.", p.keep, p.prune);
    })
}

pub fn prune(rt: &Runtime, ids: Vec<String>, from_plan: bool, json: bool) -> Result<()> {
    let ids = if from_plan {
        rt.service.plan(Utc::now())?.prune_ids()
    } else {
        ids
    };
    if ids.is_empty() {
        println!("Nothing to prune.");
        return Ok(());
    }
    let report = rt.service.prune(&ids)?;
    render::emit(json, &report, |r| {
        for id in &r.deleted {
            println!("deleted  {id}");
        }
        for refusal in &r.refused {
            println!("refused  {} ({})", refusal.archive_id, refusal.reason);
        }
        println!("Freed {}.", bytes(r.freed_bytes));
    })
}

pub fn delete(rt: &Runtime, id: &str, force: bool, json: bool) -> Result<()> {
    let manifest = match rt.service.delete(id, force) {
        Err(err @ ServiceError::ManualArchive(_)) => bail!("{err} (use --force)"),
        other => other?,
    };
    render::emit(json, &manifest, |m| println!("Deleted {} ({}).", m.archive_id, m.kind))
}

pub async fn restore(
    rt: &Runtime,
    id: &str,
    confirm: String,
    cancel: &CancelToken,
    json: bool,
) -> Result<()> {
    let options = RestoreOptions::confirmed(confirm);
    match rt.service.restore(id, &options, cancel).await {
        Ok(report) => render::emit(json, &report, print_restore),
        Err(ServiceError::Restore(RestoreError::VerificationFailed { report, .. })) => {
            render::emit(json, &*report, print_verification)?;
            bail!("restore refused: archive {id} failed verification; live data untouched")
        }
        Err(ServiceError::Restore(err)) => {
            if let Some(report) = err.report() {
                render::emit(json, report, print_restore)?;
            }
            Err(err.into())
        }
        Err(err) => Err(err.into()),
    }
}

pub fn list(rt: &Runtime, json: bool) -> Result<()> {
    let archives = rt.service.list()?;
    render::emit(json, &archives, |list| {
        if list.is_empty() {
            println!("No archives yet. Create one with `impact backup`.");
            return;
        }
        for m in list {
            println!(
                "{:<28} {:<9} {:>10} {:>8} docs  key v{}{}",
                m.archive_id,
                m.kind,
                bytes(m.size_bytes),
                m.total_documents(),
                m.encryption_key_version,
                m.note.as_deref().map(|n| format!("  \"{n}\"")).unwrap_or_default()
            );
        }
    })
}

pub fn status(rt: &Runtime, json: bool) -> Result<()> {
    let status = rt.service.status()?;
    render::emit(json, &status, |s| {
        println!("Archive root: {}", s.archive_root.display());
        println!(
            "Archives:     {} ({} manual), {}",
            s.archive_count,
            s.manual_count,
            bytes(s.total_bytes)
        );
        match s.available_bytes {
            Some(free) => println!("Free space:   {}", bytes(free)),
            None => println!("Free space:   unknown"),
        }
        match &s.latest {
            Some(latest) => println!(
                "Latest:       {} ({}, {})",
                latest.archive_id,
                latest.kind,
                latest.created_at.to_rfc3339()
            ),
            None => println!("Latest:       none"),
        }
        for (purpose, version) in &s.key_versions {
            println!("Key {purpose}: v{version}");
        }
    })
}

fn print_manifest_body(m: &ArchiveManifest) {
    println!("  created   {}", m.created_at.to_rfc3339());
    println!("  size      {}", bytes(m.size_bytes));
    println!("  key       v{}", m.encryption_key_version);
    println!("  checksum  {}", m.checksum);
    for (name, count) in &m.document_counts {
        println!("  {name:<16} {count} documents");
    }
}

fn print_verification(r: &VerificationReport) {
    println!("Archive {}", r.archive_id);
    println!("  checksum ok         {}", yes_no(r.checksum_ok));
    println!("  decryptable         {}", yes_no(r.decryptable));
    println!(
        "  manifest consistent {}",
        r.manifest_consistent.map(yes_no).unwrap_or("not checked")
    );
    println!("  key version         v{}", r.key_version);
    for issue in &r.issues {
        println!("  ! {issue}");
    }
}

fn print_restore(r: &RestoreReport) {
    println!("Restore of {}: {:?}", r.archive_id, r.outcome);
    if let Some(safety) = &r.safety_archive_id {
        println!("  safety archive {safety}");
    }
    for c in &r.collections {
        let count = |n: Option<u64>| n.map(|n| n.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "  {:<16} {:<12} before {:>6} after {:>6}{}{}",
            c.name,
            format!("{:?}", c.state),
            count(c.before),
            count(c.after),
            if c.rolled_back { "  (rolled back)" } else { "" },
            c.error.as_deref().map(|e| format!("  {e}")).unwrap_or_default()
        );
    }
    if let (Some(step), Some(error)) = (r.failed_step, &r.error) {
        println!("  failed at {step}: {error}");
    }
}
