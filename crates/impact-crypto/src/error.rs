use thiserror::Error;

use crate::keys::Purpose;

/// Failures of key loading, derivation, and version management.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The master secret could not be loaded or is empty.
    #[error("master secret unavailable: {reason}")]
    KeyUnavailable { reason: String },
    #[error("unknown key purpose: {0}")]
    UnknownPurpose(String),
    /// The version never existed or has been retired.
    #[error("unknown or retired {purpose} key version {version}")]
    UnknownKeyVersion { purpose: Purpose, version: u32 },
    #[error("cannot retire current {purpose} key version {version}")]
    RetireCurrent { purpose: Purpose, version: u32 },
    #[error("kdf parameters below minimum: {0}")]
    WeakKdf(String),
    #[error("key derivation failed: {0}")]
    Derivation(String),
    #[error("key metadata error: {0}")]
    Metadata(String),
}

/// Failures of field-level encryption.
#[derive(Debug, Error)]
pub enum FieldError {
    /// The field is not in the allowlist; deterministic encryption is never
    /// applied outside it.
    #[error("field `{0}` is not in the encryption allowlist")]
    FieldNotEncryptable(String),
    #[error("invalid allowlist entry `{0}`")]
    InvalidFieldName(String),
    #[error("the encryption allowlist is empty")]
    EmptyAllowlist,
    #[error("authentication failed for field `{field}`")]
    TamperDetected { field: String },
    #[error("unknown or retired field key version {version}")]
    UnknownKeyVersion { version: u32 },
    #[error("malformed encrypted value: {0}")]
    Malformed(String),
    #[error(transparent)]
    Key(KeyError),
}

impl From<KeyError> for FieldError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::UnknownKeyVersion { version, .. } => FieldError::UnknownKeyVersion { version },
            other => FieldError::Key(other),
        }
    }
}
