//! Key management and field-level encryption.
//!
//! Two purposes share one master secret: `field-encryption` keys protect
//! identifying attributes inside live records, `backup-encryption` keys
//! protect archives. Keys are always re-derived from the master secret and a
//! per-version salt (Argon2id); only version metadata is ever persisted.
//!
//! Field encryption is deterministic on purpose so that equality search keeps
//! working, which is why it is restricted to an explicit allowlist.

mod document;
pub mod error;
pub mod field;
pub mod keys;
pub mod secret;

pub use document::document_key_versions;
pub use error::{FieldError, KeyError};
pub use field::{
    is_encrypted, EncryptedField, FieldAllowlist, FieldCipher, Scheme, DEFAULT_ENCRYPTED_FIELDS,
    ENCRYPTION_PREFIX,
};
pub use keys::{DerivedKey, KdfParams, KeyManager, KeyVersionInfo, Purpose, KEY_LEN};
pub use secret::{
    EnvSecretSource, KeyringSecretSource, MasterSecret, MasterSecretSource, StaticSecretSource,
};
