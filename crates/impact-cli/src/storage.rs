use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use dirs::data_dir;
use impact_backup::{BackupConfig, BackupService, DiskSpace, JsonDirStore, SpaceProbe};
use impact_crypto::{
    EnvSecretSource, FieldAllowlist, FieldCipher, KeyManager, KeyringSecretSource,
    MasterSecretSource,
};
use tracing::debug;

use crate::config::{Config, SecretSource};

pub const DEFAULT_SECRET_ENV: &str = "IMPACT_MASTER_SECRET";
pub const KEYRING_SERVICE: &str = "impact";
pub const KEYRING_ACCOUNT: &str = "master-secret";

/// Resolve the default data directory.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().context("no data dir available")?;
    Ok(base.join("impact"))
}

/// Where live collections, archives and key metadata live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub live_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub key_metadata: PathBuf,
}

impl Paths {
    pub fn resolve(config: &Config) -> Result<Self> {
        let root = match &config.data_dir {
            Some(root) => root.clone(),
            None => default_data_dir()?,
        };
        Ok(Self {
            live_dir: root.join("live"),
            archive_dir: config
                .archive_dir
                .clone()
                .unwrap_or_else(|| root.join("archives")),
            key_metadata: config
                .key_metadata_path
                .clone()
                .unwrap_or_else(|| root.join("keys.json")),
        })
    }
}

pub fn secret_source(config: &Config) -> Box<dyn MasterSecretSource> {
    let settings = config.master_secret.clone().unwrap_or_default();
    match settings.source {
        SecretSource::Env => Box::new(EnvSecretSource::new(
            settings.env_var.unwrap_or_else(|| DEFAULT_SECRET_ENV.to_string()),
        )),
        SecretSource::Keyring => Box::new(keyring_source(config)),
    }
}

pub fn keyring_source(config: &Config) -> KeyringSecretSource {
    let settings = config.master_secret.clone().unwrap_or_default();
    KeyringSecretSource::new(
        settings.service.unwrap_or_else(|| KEYRING_SERVICE.to_string()),
        settings.account.unwrap_or_else(|| KEYRING_ACCOUNT.to_string()),
    )
}

/// Everything a command needs, built once from config.
pub struct Runtime {
    pub keys: Arc<KeyManager>,
    pub cipher: FieldCipher,
    pub service: BackupService,
    pub verify_prefix_chunks: Option<u32>,
}

impl Runtime {
    /// Production wiring: configured secret source, on-disk stores.
    pub fn from_config(config: &Config) -> Result<Self> {
        let paths = Paths::resolve(config)?;
        let source = secret_source(config);
        Self::build(config, &paths, source.as_ref(), Arc::new(DiskSpace))
    }

    pub fn build(
        config: &Config,
        paths: &Paths,
        source: &dyn MasterSecretSource,
        space: Arc<dyn SpaceProbe>,
    ) -> Result<Self> {
        debug!(?paths, source = %source.describe(), "initializing runtime");
        let keys = Arc::new(
            KeyManager::open(source, &paths.key_metadata, config.kdf.unwrap_or_default())
                .context("opening key manager")?,
        );

        let allowlist = match &config.encrypted_fields {
            Some(fields) => FieldAllowlist::new(fields).context("invalid encrypted_fields")?,
            None => FieldAllowlist::clinical_defaults(),
        };
        let cipher = FieldCipher::new(keys.clone(), allowlist);

        let mut backup = BackupConfig::new(&paths.archive_dir);
        if let Some(collections) = &config.collections {
            backup.collections = collections.clone();
        }
        if let Some(retention) = &config.retention {
            backup.retention = retention.clone();
        }
        backup.writer = config.writer_options();
        let live = Arc::new(JsonDirStore::new(&paths.live_dir));
        let service = BackupService::new(backup, live, keys.clone(), space)
            .context("building backup service")?;

        Ok(Self {
            keys,
            cipher,
            service,
            verify_prefix_chunks: config.backup.as_ref().and_then(|b| b.verify_prefix_chunks),
        })
    }
}

/// Runtime rooted at a temp dir with a fixed secret and the cheapest KDF.
#[cfg(test)]
pub fn test_runtime(root: &std::path::Path) -> Runtime {
    use impact_backup::FixedSpace;
    use impact_crypto::{KdfParams, StaticSecretSource};

    let config = Config {
        data_dir: Some(root.to_path_buf()),
        collections: Some(vec!["patients".into(), "episodes".into()]),
        kdf: Some(KdfParams::minimum()),
        backup: Some(crate::config::BackupSection {
            min_free_bytes: Some(0),
            chunk_size: Some(4096),
            verify_prefix_chunks: None,
        }),
        ..Config::default()
    };
    let paths = Paths::resolve(&config).expect("paths");
    let source = StaticSecretSource::new(b"cli-test-secret".to_vec()).expect("secret");
    Runtime::build(&config, &paths, &source, Arc::new(FixedSpace(u64::MAX))).expect("runtime")
}
