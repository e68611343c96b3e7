use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use impact_backup::{RetentionPolicy, WriterOptions, DEFAULT_COLLECTIONS};
use impact_crypto::{KdfParams, DEFAULT_ENCRYPTED_FIELDS};
use serde::{Deserialize, Serialize};

/// Operator configuration loaded from `~/.config/impact/config.toml`
/// (platform-specific). Every field is optional; unset values fall back to
/// built-in defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Root for live data, archives and key metadata.
    pub data_dir: Option<PathBuf>,
    /// Override for the archive directory.
    pub archive_dir: Option<PathBuf>,
    /// Override for the key version metadata file.
    pub key_metadata_path: Option<PathBuf>,
    /// Field names that may be encrypted.
    pub encrypted_fields: Option<Vec<String>>,
    /// Collections included in every backup.
    pub collections: Option<Vec<String>>,
    pub master_secret: Option<MasterSecretConfig>,
    pub retention: Option<RetentionPolicy>,
    pub backup: Option<BackupSection>,
    pub kdf: Option<KdfParams>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SecretSource {
    #[default]
    Env,
    Keyring,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MasterSecretConfig {
    #[serde(default)]
    pub source: SecretSource,
    pub env_var: Option<String>,
    pub service: Option<String>,
    pub account: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BackupSection {
    pub min_free_bytes: Option<u64>,
    pub chunk_size: Option<u32>,
    /// Default depth for `verify`; unset means full verification.
    pub verify_prefix_chunks: Option<u32>,
}

impl Config {
    /// A config with every section spelled out, for `config init`.
    pub fn starter() -> Self {
        let writer = WriterOptions::default();
        Self {
            data_dir: None,
            archive_dir: None,
            key_metadata_path: None,
            encrypted_fields: Some(DEFAULT_ENCRYPTED_FIELDS.iter().map(|s| s.to_string()).collect()),
            collections: Some(DEFAULT_COLLECTIONS.iter().map(|s| s.to_string()).collect()),
            master_secret: Some(MasterSecretConfig::default()),
            retention: Some(RetentionPolicy::default()),
            backup: Some(BackupSection {
                min_free_bytes: Some(writer.min_free_bytes),
                chunk_size: Some(writer.chunk_size),
                verify_prefix_chunks: None,
            }),
            kdf: Some(KdfParams::default()),
        }
    }

    pub fn writer_options(&self) -> WriterOptions {
        let defaults = WriterOptions::default();
        let section = self.backup.clone().unwrap_or_default();
        WriterOptions {
            min_free_bytes: section.min_free_bytes.unwrap_or(defaults.min_free_bytes),
            chunk_size: section.chunk_size.unwrap_or(defaults.chunk_size),
        }
    }
}

/// Load config from `path`, or the default path when `None`; if missing,
/// return defaults.
pub fn load(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_from_path(path),
        None => load_from_path(default_path()?),
    }
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("impact").join("config.toml"))
}

/// Write `config` to `path` unless a file is already there, so user edits
/// are never clobbered. Returns the path either way.
pub fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;

    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn parses_custom_config() {
        let contents = r#"
            data_dir = "/srv/impact"
            encrypted_fields = ["nhs_number", "mrn"]
            collections = ["patients"]
            [master_secret]
            source = "keyring"
            service = "impact"
            account = "master"
            [retention]
            daily_days = 14
            weekly_anchor = "Mon"
            [backup]
            min_free_bytes = 1048576
            verify_prefix_chunks = 8
            [kdf]
            memory_kib = 65536
            iterations = 3
            parallelism = 2
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/srv/impact")));
        assert_eq!(cfg.encrypted_fields, Some(vec!["nhs_number".into(), "mrn".into()]));
        assert_eq!(
            cfg.master_secret,
            Some(MasterSecretConfig {
                source: SecretSource::Keyring,
                env_var: None,
                service: Some("impact".into()),
                account: Some("master".into()),
            })
        );
        let retention = cfg.retention.clone().expect("retention");
        assert_eq!(retention.daily_days, 14);
        assert_eq!(retention.weekly_until_days, 90);
        assert_eq!(retention.weekly_anchor, Weekday::Mon);
        assert_eq!(cfg.writer_options().min_free_bytes, 1_048_576);
        assert_eq!(cfg.writer_options().chunk_size, WriterOptions::default().chunk_size);
        assert_eq!(
            cfg.kdf,
            Some(KdfParams {
                memory_kib: 65536,
                iterations: 3,
                parallelism: 2,
            })
        );
    }

    #[test]
    fn starter_config_round_trips_and_is_written_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config::starter();

        write_if_missing(&cfg, &path).expect("write should succeed");
        let second = write_if_missing(&Config::default(), &path).expect("second write ok");
        assert_eq!(second, path);
        assert_eq!(load_from_path(&path).expect("load"), cfg);
    }
}
