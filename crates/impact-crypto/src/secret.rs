use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::KeyError;

/// Master secret bytes (never logged, zeroized on drop).
#[derive(Clone)]
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl MasterSecret {
    /// Wrap secret bytes; empty secrets are rejected.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, KeyError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(KeyError::KeyUnavailable {
                reason: "master secret is empty".to_string(),
            });
        }
        Ok(Self(Zeroizing::new(bytes)))
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

/// Supplies the master secret at process start (environment, OS keychain,
/// or a fixed value in tests).
pub trait MasterSecretSource: Send + Sync {
    /// Short description for logs; must not contain secret material.
    fn describe(&self) -> String;

    fn load(&self) -> Result<MasterSecret, KeyError>;
}

/// Reads the secret from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvSecretSource {
    var: String,
}

impl EnvSecretSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl MasterSecretSource for EnvSecretSource {
    fn describe(&self) -> String {
        format!("env:{}", self.var)
    }

    fn load(&self) -> Result<MasterSecret, KeyError> {
        let value = std::env::var(&self.var).map_err(|e| KeyError::KeyUnavailable {
            reason: format!("{}: {e}", self.var),
        })?;
        MasterSecret::new(value.into_bytes())
    }
}

/// OS keyring-backed source. The secret is stored base64-encoded.
#[derive(Debug, Clone)]
pub struct KeyringSecretSource {
    service: String,
    account: String,
}

impl KeyringSecretSource {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    /// Store a fresh random secret unless one exists. Returns `true` when a
    /// new secret was created.
    pub fn provision(&self) -> Result<bool, KeyError> {
        let entry = self.entry()?;
        if entry.get_password().is_ok() {
            return Ok(false);
        }

        let mut bytes = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut *bytes);
        entry
            .set_password(&general_purpose::STANDARD.encode(&*bytes))
            .map_err(|e| KeyError::KeyUnavailable {
                reason: format!("keyring: {e}"),
            })?;
        Ok(true)
    }

    fn entry(&self) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, &self.account).map_err(|e| KeyError::KeyUnavailable {
            reason: format!("keyring: {e}"),
        })
    }
}

impl MasterSecretSource for KeyringSecretSource {
    fn describe(&self) -> String {
        format!("keyring:{}/{}", self.service, self.account)
    }

    fn load(&self) -> Result<MasterSecret, KeyError> {
        let encoded = Zeroizing::new(self.entry()?.get_password().map_err(|e| {
            KeyError::KeyUnavailable {
                reason: format!("keyring: {e}"),
            }
        })?);
        let bytes = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| KeyError::KeyUnavailable {
                reason: format!("keyring secret is not base64: {e}"),
            })?;
        MasterSecret::new(bytes)
    }
}

/// Fixed secret for tests and embedding.
#[derive(Debug, Clone)]
pub struct StaticSecretSource {
    secret: MasterSecret,
}

impl StaticSecretSource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, KeyError> {
        Ok(Self {
            secret: MasterSecret::new(bytes)?,
        })
    }
}

impl MasterSecretSource for StaticSecretSource {
    fn describe(&self) -> String {
        "static".to_string()
    }

    fn load(&self) -> Result<MasterSecret, KeyError> {
        Ok(self.secret.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_secret_is_unavailable() {
        let err = MasterSecret::new(Vec::new()).expect_err("empty must fail");
        assert!(matches!(err, KeyError::KeyUnavailable { .. }));
    }

    #[test]
    fn missing_env_var_is_unavailable() {
        let source = EnvSecretSource::new("IMPACT_TEST_SECRET_THAT_IS_NEVER_SET");
        let err = source.load().expect_err("unset var must fail");
        assert!(matches!(err, KeyError::KeyUnavailable { .. }));
    }

    #[test]
    fn debug_output_is_redacted() {
        let secret = MasterSecret::new(b"hunter2".to_vec()).expect("secret");
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn static_source_returns_its_secret() {
        let source = StaticSecretSource::new(b"abc".to_vec()).expect("source");
        assert_eq!(source.load().expect("load").expose(), b"abc");
        assert_eq!(source.describe(), "static");
    }
}
