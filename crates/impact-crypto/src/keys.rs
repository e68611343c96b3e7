use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Mutex, RwLock},
};

use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::{
    error::KeyError,
    secret::{MasterSecret, MasterSecretSource},
};

/// Derived key length: AES-256.
pub const KEY_LEN: usize = 32;
/// Per-version salt length.
pub const SALT_LEN: usize = 16;

const REGISTRY_FORMAT: u32 = 1;

/// What a derived key is used for. Each purpose has its own version chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Purpose {
    FieldEncryption,
    BackupEncryption,
}

impl Purpose {
    pub const ALL: [Purpose; 2] = [Purpose::FieldEncryption, Purpose::BackupEncryption];

    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::FieldEncryption => "field-encryption",
            Purpose::BackupEncryption => "backup-encryption",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Purpose {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Purpose::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| KeyError::UnknownPurpose(s.to_string()))
    }
}

/// Argon2id work factors. Values below [`KdfParams::minimum`] are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    pub const MIN_MEMORY_KIB: u32 = 8 * 1024;
    pub const MIN_ITERATIONS: u32 = 2;
    pub const MIN_PARALLELISM: u32 = 1;

    /// The weakest parameters accepted.
    pub const fn minimum() -> Self {
        Self {
            memory_kib: Self::MIN_MEMORY_KIB,
            iterations: Self::MIN_ITERATIONS,
            parallelism: Self::MIN_PARALLELISM,
        }
    }

    pub fn validate(&self) -> Result<(), KeyError> {
        if self.memory_kib < Self::MIN_MEMORY_KIB {
            return Err(KeyError::WeakKdf(format!(
                "memory {} KiB < {} KiB",
                self.memory_kib,
                Self::MIN_MEMORY_KIB
            )));
        }
        if self.iterations < Self::MIN_ITERATIONS {
            return Err(KeyError::WeakKdf(format!(
                "iterations {} < {}",
                self.iterations,
                Self::MIN_ITERATIONS
            )));
        }
        if self.parallelism < Self::MIN_PARALLELISM {
            return Err(KeyError::WeakKdf("parallelism must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// A symmetric key for one purpose and version. Zeroized on drop; `Debug`
/// never prints the bytes.
#[derive(Clone)]
pub struct DerivedKey {
    purpose: Purpose,
    version: u32,
    params: KdfParams,
    bytes: Zeroizing<[u8; KEY_LEN]>,
}

impl DerivedKey {
    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn params(&self) -> KdfParams {
        self.params
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("purpose", &self.purpose)
            .field("version", &self.version)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Public view of one key version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyVersionInfo {
    pub purpose: Purpose,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRecord {
    version: u32,
    salt: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    retired_at: Option<DateTime<Utc>>,
    kdf: KdfParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PurposeRecord {
    current: u32,
    versions: Vec<VersionRecord>,
}

impl PurposeRecord {
    fn version(&self, version: u32) -> Option<&VersionRecord> {
        self.versions.iter().find(|v| v.version == version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRegistry {
    format: u32,
    purposes: BTreeMap<Purpose, PurposeRecord>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self {
            format: REGISTRY_FORMAT,
            purposes: BTreeMap::new(),
        }
    }
}

/// Root of trust: derives, versions, rotates and retires keys for every
/// [`Purpose`]. One instance is created at startup and passed by reference.
pub struct KeyManager {
    secret: MasterSecret,
    metadata_path: Option<PathBuf>,
    kdf: KdfParams,
    registry: RwLock<KeyRegistry>,
    cache: RwLock<HashMap<(Purpose, u32), Zeroizing<[u8; KEY_LEN]>>>,
    rotation: Mutex<()>,
}

impl KeyManager {
    /// Load the master secret and the version metadata file, creating version
    /// 1 for any purpose seen for the first time.
    #[instrument(skip_all, fields(source = %source.describe()))]
    pub fn open(
        source: &dyn MasterSecretSource,
        metadata_path: impl Into<PathBuf>,
        kdf: KdfParams,
    ) -> Result<Self, KeyError> {
        kdf.validate()?;
        let secret = source.load()?;
        let metadata_path = metadata_path.into();
        let mut registry = read_registry(&metadata_path)?;
        if initialise_missing(&mut registry, kdf) {
            write_registry(&metadata_path, &registry)?;
        }
        Ok(Self::from_parts(secret, Some(metadata_path), kdf, registry))
    }

    /// Manager whose version metadata lives only in memory.
    pub fn in_memory(secret: MasterSecret, kdf: KdfParams) -> Result<Self, KeyError> {
        kdf.validate()?;
        let mut registry = KeyRegistry::default();
        initialise_missing(&mut registry, kdf);
        Ok(Self::from_parts(secret, None, kdf, registry))
    }

    fn from_parts(
        secret: MasterSecret,
        metadata_path: Option<PathBuf>,
        kdf: KdfParams,
        registry: KeyRegistry,
    ) -> Self {
        Self {
            secret,
            metadata_path,
            kdf,
            registry: RwLock::new(registry),
            cache: RwLock::new(HashMap::new()),
            rotation: Mutex::new(()),
        }
    }

    pub fn current_version(&self, purpose: Purpose) -> Result<u32, KeyError> {
        let registry = self.read_registry()?;
        Ok(purpose_record(&registry, purpose)?.current)
    }

    /// Every version ever created for a purpose, oldest first.
    pub fn versions(&self, purpose: Purpose) -> Result<Vec<KeyVersionInfo>, KeyError> {
        let registry = self.read_registry()?;
        let record = purpose_record(&registry, purpose)?;
        Ok(record
            .versions
            .iter()
            .map(|v| KeyVersionInfo {
                purpose,
                version: v.version,
                created_at: v.created_at,
                retired_at: v.retired_at,
                current: v.version == record.current,
            })
            .collect())
    }

    /// Versions that can still be derived.
    pub fn live_versions(&self, purpose: Purpose) -> Result<Vec<u32>, KeyError> {
        Ok(self
            .versions(purpose)?
            .into_iter()
            .filter(|v| v.retired_at.is_none())
            .map(|v| v.version)
            .collect())
    }

    /// Derive the key for `purpose` at `version` (current when `None`).
    pub fn derive_key(
        &self,
        purpose: Purpose,
        version: Option<u32>,
    ) -> Result<DerivedKey, KeyError> {
        let (version, record) = {
            let registry = self.read_registry()?;
            let purpose_rec = purpose_record(&registry, purpose)?;
            let version = version.unwrap_or(purpose_rec.current);
            let record = purpose_rec
                .version(version)
                .filter(|v| v.retired_at.is_none())
                .cloned()
                .ok_or(KeyError::UnknownKeyVersion { purpose, version })?;
            (version, record)
        };

        if let Some(bytes) = self.cached(purpose, version)? {
            return Ok(DerivedKey {
                purpose,
                version,
                params: record.kdf,
                bytes,
            });
        }

        let bytes = self.stretch(&record)?;
        self.cache
            .write()
            .map_err(|err| KeyError::Metadata(format!("cache lock poisoned: {err}")))?
            .insert((purpose, version), bytes.clone());
        debug!(%purpose, version, "derived key");
        Ok(DerivedKey {
            purpose,
            version,
            params: record.kdf,
            bytes,
        })
    }

    /// Create a new current version for `purpose`. Older versions stay
    /// derivable until retired.
    #[instrument(skip(self), fields(%purpose))]
    pub fn rotate(&self, purpose: Purpose) -> Result<u32, KeyError> {
        let _rotating = self
            .rotation
            .lock()
            .map_err(|err| KeyError::Metadata(format!("rotation lock poisoned: {err}")))?;

        let mut next = self.read_registry()?.clone();
        let record = next
            .purposes
            .get_mut(&purpose)
            .ok_or_else(|| KeyError::UnknownPurpose(purpose.to_string()))?;
        let version = record.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1;
        record.versions.push(new_version(version, self.kdf));
        record.current = version;

        self.commit(next)?;
        info!(target: "audit", %purpose, version, "key rotated");
        Ok(version)
    }

    /// Mark a non-current version as retired; it can no longer be derived.
    /// Callers must first prove nothing still depends on it.
    #[instrument(skip(self), fields(%purpose))]
    pub fn retire(&self, purpose: Purpose, version: u32) -> Result<(), KeyError> {
        let _rotating = self
            .rotation
            .lock()
            .map_err(|err| KeyError::Metadata(format!("rotation lock poisoned: {err}")))?;

        let mut next = self.read_registry()?.clone();
        let record = next
            .purposes
            .get_mut(&purpose)
            .ok_or_else(|| KeyError::UnknownPurpose(purpose.to_string()))?;
        if record.current == version {
            return Err(KeyError::RetireCurrent { purpose, version });
        }
        let entry = record
            .versions
            .iter_mut()
            .find(|v| v.version == version && v.retired_at.is_none())
            .ok_or(KeyError::UnknownKeyVersion { purpose, version })?;
        entry.retired_at = Some(Utc::now());

        self.commit(next)?;
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&(purpose, version));
        }
        info!(target: "audit", %purpose, version, "key version retired");
        Ok(())
    }

    fn commit(&self, next: KeyRegistry) -> Result<(), KeyError> {
        if let Some(path) = &self.metadata_path {
            write_registry(path, &next)?;
        }
        *self
            .registry
            .write()
            .map_err(|err| KeyError::Metadata(format!("registry lock poisoned: {err}")))? = next;
        Ok(())
    }

    fn read_registry(&self) -> Result<std::sync::RwLockReadGuard<'_, KeyRegistry>, KeyError> {
        self.registry
            .read()
            .map_err(|err| KeyError::Metadata(format!("registry lock poisoned: {err}")))
    }

    fn cached(
        &self,
        purpose: Purpose,
        version: u32,
    ) -> Result<Option<Zeroizing<[u8; KEY_LEN]>>, KeyError> {
        let cache = self
            .cache
            .read()
            .map_err(|err| KeyError::Metadata(format!("cache lock poisoned: {err}")))?;
        Ok(cache.get(&(purpose, version)).cloned())
    }

    fn stretch(&self, record: &VersionRecord) -> Result<Zeroizing<[u8; KEY_LEN]>, KeyError> {
        record.kdf.validate()?;
        let salt = hex::decode(&record.salt)
            .map_err(|e| KeyError::Metadata(format!("salt for version {}: {e}", record.version)))?;
        let params = Params::new(
            record.kdf.memory_kib,
            record.kdf.iterations,
            record.kdf.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| KeyError::Derivation(format!("invalid argon2 params: {e}")))?;

        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(self.secret.expose(), &salt, &mut *out)
            .map_err(|e| KeyError::Derivation(e.to_string()))?;
        Ok(out)
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("metadata_path", &self.metadata_path)
            .field("kdf", &self.kdf)
            .finish_non_exhaustive()
    }
}

fn purpose_record(registry: &KeyRegistry, purpose: Purpose) -> Result<&PurposeRecord, KeyError> {
    registry
        .purposes
        .get(&purpose)
        .ok_or_else(|| KeyError::UnknownPurpose(purpose.to_string()))
}

fn new_version(version: u32, kdf: KdfParams) -> VersionRecord {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    VersionRecord {
        version,
        salt: hex::encode(salt),
        created_at: Utc::now(),
        retired_at: None,
        kdf,
    }
}

/// Returns `true` when anything was added.
fn initialise_missing(registry: &mut KeyRegistry, kdf: KdfParams) -> bool {
    let mut changed = false;
    for purpose in Purpose::ALL {
        registry.purposes.entry(purpose).or_insert_with(|| {
            changed = true;
            info!(target: "audit", %purpose, version = 1, "key purpose initialised");
            PurposeRecord {
                current: 1,
                versions: vec![new_version(1, kdf)],
            }
        });
    }
    changed
}

fn read_registry(path: &Path) -> Result<KeyRegistry, KeyError> {
    match fs::read(path) {
        Ok(bytes) => {
            let registry: KeyRegistry = serde_json::from_slice(&bytes)
                .map_err(|e| KeyError::Metadata(format!("{}: {e}", path.display())))?;
            if registry.format != REGISTRY_FORMAT {
                return Err(KeyError::Metadata(format!(
                    "unsupported key metadata format {}",
                    registry.format
                )));
            }
            Ok(registry)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(KeyRegistry::default()),
        Err(err) => Err(KeyError::Metadata(format!("{}: {err}", path.display()))),
    }
}

fn write_registry(path: &Path, registry: &KeyRegistry) -> Result<(), KeyError> {
    let parent = path
        .parent()
        .ok_or_else(|| KeyError::Metadata("invalid metadata path".to_string()))?;
    fs::create_dir_all(parent).map_err(metadata_err)?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(metadata_err)?;
    let json = serde_json::to_vec_pretty(registry).map_err(metadata_err)?;
    tmp.write_all(&json).map_err(metadata_err)?;
    tmp.flush().map_err(metadata_err)?;
    tmp.persist(path).map_err(|e| metadata_err(e.error))?;
    Ok(())
}

fn metadata_err<E: ToString>(err: E) -> KeyError {
    KeyError::Metadata(err.to_string())
}

#[cfg(test)]
pub(crate) fn test_manager() -> KeyManager {
    let secret = MasterSecret::new(b"test-master-secret".to_vec()).expect("secret");
    KeyManager::in_memory(secret, KdfParams::minimum()).expect("manager")
}
