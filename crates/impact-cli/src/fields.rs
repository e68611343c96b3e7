//! Field encryption commands over live collections.

use anyhow::{Context, Result};
use impact_core::Document;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::{render, storage::Runtime};

#[derive(Debug, Serialize)]
pub struct MigrationReport {
    pub collection: String,
    pub documents: usize,
    pub encrypted: usize,
    pub reencrypted: usize,
}

/// Encrypt plaintext allowlisted values and move older key versions to the
/// current one. Holds the live-data lock for the whole rewrite.
pub async fn migrate(rt: &Runtime, collection: &str, json: bool) -> Result<()> {
    let live = rt.service.live();
    let _guard = rt.service.lock().acquire("fields-migrate").await;
    let mut docs = live
        .read_all(collection)
        .await
        .with_context(|| format!("reading {collection}"))?;

    let mut report = MigrationReport {
        collection: collection.to_string(),
        documents: docs.len(),
        encrypted: 0,
        reencrypted: 0,
    };
    for doc in &mut docs {
        report.encrypted += rt.cipher.encrypt_document(doc)?;
        report.reencrypted += rt.cipher.reencrypt_document(doc)?;
    }
    if report.encrypted + report.reencrypted > 0 {
        live.replace_all(collection, docs)
            .await
            .with_context(|| format!("writing {collection}"))?;
    }
    info!(
        target: "audit",
        collection,
        encrypted = report.encrypted,
        reencrypted = report.reencrypted,
        "field migration finished"
    );
    render::emit(json, &report, |r| {
        println!(
            "{}: {} documents, {} values encrypted, {} re-encrypted.",
            r.collection, r.documents, r.encrypted, r.reencrypted
        );
    })
}

#[derive(Debug, Serialize)]
pub struct SearchReport {
    pub collection: String,
    pub field: String,
    pub matches: Vec<Document>,
}

/// Equality search on an encrypted field. Matches are returned decrypted.
pub async fn find(rt: &Runtime, collection: &str, field: &str, value: &str, json: bool) -> Result<()> {
    let candidates = rt.cipher.search_candidates(field, value)?;
    let docs = rt
        .service
        .live()
        .read_all(collection)
        .await
        .with_context(|| format!("reading {collection}"))?;

    let mut matches = Vec::new();
    for mut doc in docs {
        if field_matches(&doc, field, &candidates) {
            rt.cipher.decrypt_document(&mut doc)?;
            matches.push(doc);
        }
    }
    let report = SearchReport {
        collection: collection.to_string(),
        field: field.to_string(),
        matches,
    };
    render::emit(json, &report, |r| {
        println!("{} match(es) in {} on {}.", r.matches.len(), r.collection, r.field);
        for doc in &r.matches {
            println!("  {}", Value::Object(doc.clone()));
        }
    })
}

/// Searches the same places the cipher encrypts: top-level keys, nested
/// objects and objects inside arrays.
fn field_matches(doc: &Document, field: &str, candidates: &[String]) -> bool {
    doc.iter().any(|(key, value)| match value {
        Value::String(s) if key == field => candidates.iter().any(|c| c == s),
        Value::Object(inner) => field_matches(inner, field, candidates),
        Value::Array(items) => items.iter().any(|item| match item {
            Value::Object(inner) => field_matches(inner, field, candidates),
            _ => false,
        }),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use impact_crypto::{is_encrypted, Purpose};
    use serde_json::json;

    use super::*;
    use crate::storage::test_runtime;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn migrate_encrypts_then_moves_to_current_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rt = test_runtime(dir.path());
        let live = rt.service.live();
        live.replace_all(
            "patients",
            vec![doc(json!({
                "patient_id": "P-1",
                "nhs_number": "9434765919",
                "demographics": {"postcode": "LS1 4AP"}
            }))],
        )
        .await
        .expect("seed");

        migrate(&rt, "patients", true).await.expect("migrate");
        let stored = live.read_all("patients").await.expect("read");
        let nhs = stored[0]["nhs_number"].as_str().expect("string");
        assert!(is_encrypted(nhs));
        assert_eq!(stored[0]["patient_id"], json!("P-1"));
        assert!(is_encrypted(
            stored[0]["demographics"]["postcode"].as_str().expect("string")
        ));

        rt.keys.rotate(Purpose::FieldEncryption).expect("rotate");
        migrate(&rt, "patients", true).await.expect("migrate again");
        let moved = live.read_all("patients").await.expect("read");
        assert_ne!(moved[0]["nhs_number"].as_str(), Some(nhs));
        assert_eq!(
            rt.cipher
                .decrypt_str("nhs_number", moved[0]["nhs_number"].as_str().expect("string"))
                .expect("decrypt"),
            "9434765919"
        );
    }

    #[tokio::test]
    async fn find_matches_fields_inside_arrays() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rt = test_runtime(dir.path());
        let live = rt.service.live();
        live.replace_all(
            "patients",
            vec![
                doc(json!({
                    "patient_id": "P-1",
                    "episodes": [
                        {"episode_id": "E-1", "hospital_number": "H-100"},
                        {"episode_id": "E-2", "hospital_number": "H-200"}
                    ]
                })),
                doc(json!({
                    "patient_id": "P-2",
                    "episodes": [{"episode_id": "E-3", "hospital_number": "H-300"}]
                })),
            ],
        )
        .await
        .expect("seed");
        migrate(&rt, "patients", true).await.expect("migrate");

        let stored = live.read_all("patients").await.expect("read");
        assert!(is_encrypted(
            stored[0]["episodes"][1]["hospital_number"]
                .as_str()
                .expect("string")
        ));
        let candidates = rt
            .cipher
            .search_candidates("hospital_number", "H-200")
            .expect("candidates");
        let hits: Vec<_> = stored
            .iter()
            .filter(|d| field_matches(d, "hospital_number", &candidates))
            .map(|d| d["patient_id"].clone())
            .collect();
        assert_eq!(hits, vec![json!("P-1")]);
    }

    #[tokio::test]
    async fn find_matches_nested_fields_across_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rt = test_runtime(dir.path());
        let live = rt.service.live();
        live.replace_all(
            "patients",
            vec![
                doc(json!({"patient_id": "P-1", "demographics": {"postcode": "LS1 4AP"}})),
                doc(json!({"patient_id": "P-2", "demographics": {"postcode": "M1 1AE"}})),
            ],
        )
        .await
        .expect("seed");
        migrate(&rt, "patients", true).await.expect("migrate");

        // P-3 written under v2 while P-1 still carries v1.
        rt.keys.rotate(Purpose::FieldEncryption).expect("rotate");
        let mut docs = live.read_all("patients").await.expect("read");
        let mut third = doc(json!({"patient_id": "P-3", "demographics": {"postcode": "LS1 4AP"}}));
        rt.cipher.encrypt_document(&mut third).expect("encrypt");
        docs.push(third);
        live.replace_all("patients", docs).await.expect("write");

        let candidates = rt.cipher.search_candidates("postcode", "LS1 4AP").expect("candidates");
        let stored = live.read_all("patients").await.expect("read");
        let hits: Vec<_> = stored
            .iter()
            .filter(|d| field_matches(d, "postcode", &candidates))
            .map(|d| d["patient_id"].clone())
            .collect();
        assert_eq!(hits, vec![json!("P-1"), json!("P-3")]);

        find(&rt, "patients", "postcode", "LS1 4AP", true)
            .await
            .expect("find");
        assert!(find(&rt, "patients", "patient_id", "P-1", true).await.is_err());
    }
}
