use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an archive came to exist. Manual archives are never pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Automatic,
    Manual,
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ArchiveKind::Automatic => "automatic",
            ArchiveKind::Manual => "manual",
        })
    }
}

impl FromStr for ArchiveKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(ArchiveKind::Automatic),
            "manual" => Ok(ArchiveKind::Manual),
            other => Err(format!("unknown archive kind `{other}`")),
        }
    }
}

/// Plaintext description of one archive, readable without the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub archive_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: ArchiveKind,
    pub collections: Vec<String>,
    pub document_counts: BTreeMap<String, u64>,
    /// Size of the encrypted blob.
    pub size_bytes: u64,
    /// SHA-256 of the encrypted blob, lowercase hex.
    pub checksum: String,
    pub encryption_key_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ArchiveManifest {
    pub fn total_documents(&self) -> u64 {
        self.document_counts.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_json_uses_documented_field_names() {
        let manifest = ArchiveManifest {
            archive_id: "20261019T120000Z-0a1b2c3d".into(),
            created_at: "2026-10-19T12:00:00Z".parse().expect("timestamp"),
            kind: ArchiveKind::Manual,
            collections: vec!["patients".into()],
            document_counts: BTreeMap::from([("patients".into(), 3)]),
            size_bytes: 120,
            checksum: "ab".repeat(32),
            encryption_key_version: 2,
            note: None,
        };
        let json = serde_json::to_value(&manifest).expect("serialize");
        assert_eq!(json["kind"], "manual");
        assert_eq!(json["document_counts"]["patients"], 3);
        assert_eq!(json["encryption_key_version"], 2);
        assert!(json.get("note").is_none());

        let back: ArchiveManifest = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, manifest);
        assert_eq!(back.total_documents(), 3);
    }

    #[test]
    fn kind_parses_from_cli_text() {
        assert_eq!("manual".parse::<ArchiveKind>(), Ok(ArchiveKind::Manual));
        assert!("weekly".parse::<ArchiveKind>().is_err());
    }
}
