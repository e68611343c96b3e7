use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{
    error::{FieldError, KeyError},
    keys::{DerivedKey, KeyManager, Purpose, KEY_LEN},
};

type HmacSha256 = Hmac<Sha256>;

/// Textual prefix shared by every encrypted value.
pub const ENCRYPTION_PREFIX: &str = "ENC:";

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SUBKEY_SALT: &[u8] = b"impact:field-subkeys:v1";
const ENC_INFO: &[u8] = b"impact:field:enc:v1";
const IV_INFO: &[u8] = b"impact:field:iv:v1";

/// Identifying attributes encrypted when no explicit list is configured.
pub const DEFAULT_ENCRYPTED_FIELDS: &[&str] = &[
    "nhs_number",
    "mrn",
    "hospital_number",
    "first_name",
    "last_name",
    "date_of_birth",
    "deceased_date",
    "postcode",
];

/// Encryption scheme identifier carried in every ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Synthetic-IV AES-256-GCM: deterministic, authenticated.
    Det1,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Det1 => "DET1",
        }
    }
}

/// One encrypted value: `ENC:DET1:v<version>:<iv>.<ciphertext>.<tag>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedField {
    pub scheme: Scheme,
    pub key_version: u32,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl fmt::Display for EncryptedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ENCRYPTION_PREFIX}{}:v{}:{}.{}.{}",
            self.scheme.as_str(),
            self.key_version,
            URL_SAFE_NO_PAD.encode(self.iv),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
            URL_SAFE_NO_PAD.encode(self.tag)
        )
    }
}

impl FromStr for EncryptedField {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(ENCRYPTION_PREFIX)
            .ok_or_else(|| FieldError::Malformed("missing prefix".into()))?;
        let mut parts = rest.splitn(3, ':');
        let (Some(scheme), Some(version), Some(body)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(FieldError::Malformed("expected scheme, version and body".into()));
        };

        let scheme = match scheme {
            "DET1" => Scheme::Det1,
            other => return Err(FieldError::Malformed(format!("unknown scheme {other}"))),
        };
        let key_version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| FieldError::Malformed(format!("bad key version {version}")))?;

        let mut pieces = body.split('.');
        let (Some(iv), Some(ciphertext), Some(tag), None) =
            (pieces.next(), pieces.next(), pieces.next(), pieces.next())
        else {
            return Err(FieldError::Malformed("expected iv.ciphertext.tag".into()));
        };

        Ok(Self {
            scheme,
            key_version,
            iv: decode_fixed(iv, "iv")?,
            ciphertext: URL_SAFE_NO_PAD
                .decode(ciphertext)
                .map_err(|e| FieldError::Malformed(format!("ciphertext: {e}")))?,
            tag: decode_fixed(tag, "tag")?,
        })
    }
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N], FieldError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| FieldError::Malformed(format!("{what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| FieldError::Malformed(format!("{what}: expected {N} bytes, got {}", b.len())))
}

/// Whether a stored value already carries the encryption prefix.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTION_PREFIX)
}

/// The only field names that may be encrypted deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAllowlist {
    names: BTreeSet<String>,
}

impl FieldAllowlist {
    pub fn new<I, S>(names: I) -> Result<Self, FieldError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for name in names {
            let name = name.into();
            if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '.') {
                return Err(FieldError::InvalidFieldName(name));
            }
            set.insert(name);
        }
        if set.is_empty() {
            return Err(FieldError::EmptyAllowlist);
        }
        Ok(Self { names: set })
    }

    /// The clinical identifiers in [`DEFAULT_ENCRYPTED_FIELDS`].
    pub fn clinical_defaults() -> Self {
        Self {
            names: DEFAULT_ENCRYPTED_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.names.contains(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    fn check(&self, field: &str) -> Result<(), FieldError> {
        if self.contains(field) {
            Ok(())
        } else {
            Err(FieldError::FieldNotEncryptable(field.to_string()))
        }
    }
}

/// Deterministic, authenticated encryption of allowlisted fields.
///
/// The IV is an HMAC of the field name and plaintext, so equal plaintexts
/// under the same field and key version produce identical ciphertext and can
/// be matched with an equality query. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct FieldCipher {
    keys: Arc<KeyManager>,
    allowlist: FieldAllowlist,
}

struct Subkeys {
    enc: Zeroizing<[u8; KEY_LEN]>,
    iv: Zeroizing<[u8; KEY_LEN]>,
}

impl FieldCipher {
    pub fn new(keys: Arc<KeyManager>, allowlist: FieldAllowlist) -> Self {
        Self { keys, allowlist }
    }

    pub fn allowlist(&self) -> &FieldAllowlist {
        &self.allowlist
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn current_version(&self) -> Result<u32, FieldError> {
        Ok(self.keys.current_version(Purpose::FieldEncryption)?)
    }

    /// Encrypt under the current field-encryption key.
    pub fn encrypt(&self, field: &str, plaintext: &str) -> Result<EncryptedField, FieldError> {
        self.encrypt_with_version(field, plaintext, None)
    }

    /// Encrypt under a specific live key version (current when `None`).
    pub fn encrypt_with_version(
        &self,
        field: &str,
        plaintext: &str,
        version: Option<u32>,
    ) -> Result<EncryptedField, FieldError> {
        self.allowlist.check(field)?;
        let key = self.keys.derive_key(Purpose::FieldEncryption, version)?;
        let subkeys = subkeys(&key)?;

        let iv = synthetic_iv(&subkeys, field, plaintext.as_bytes())?;
        let cipher = build_cipher(&subkeys)?;
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&iv),
                &associated_data(field, key.version()),
                &mut buffer,
            )
            .map_err(|e| FieldError::Key(KeyError::Derivation(format!("encrypt failed: {e}"))))?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());
        Ok(EncryptedField {
            scheme: Scheme::Det1,
            key_version: key.version(),
            iv,
            ciphertext: buffer,
            tag: tag_bytes,
        })
    }

    pub fn decrypt(&self, field: &str, value: &EncryptedField) -> Result<String, FieldError> {
        self.allowlist.check(field)?;
        let key = self
            .keys
            .derive_key(Purpose::FieldEncryption, Some(value.key_version))?;
        let subkeys = subkeys(&key)?;
        let cipher = build_cipher(&subkeys)?;

        let tampered = || FieldError::TamperDetected {
            field: field.to_string(),
        };
        let mut buffer = value.ciphertext.clone();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&value.iv),
                &associated_data(field, value.key_version),
                &mut buffer,
                Tag::from_slice(&value.tag),
            )
            .map_err(|_| tampered())?;

        if synthetic_iv(&subkeys, field, &buffer)? != value.iv {
            return Err(tampered());
        }
        String::from_utf8(buffer).map_err(|_| tampered())
    }

    /// Encrypt and render as stored text.
    pub fn encrypt_str(&self, field: &str, plaintext: &str) -> Result<String, FieldError> {
        Ok(self.encrypt(field, plaintext)?.to_string())
    }

    /// Parse stored text and decrypt it.
    pub fn decrypt_str(&self, field: &str, stored: &str) -> Result<String, FieldError> {
        self.decrypt(field, &stored.parse()?)
    }

    /// Stored forms of `plaintext` under every live key version, newest
    /// first. Matching any of them finds the record during a rotation.
    pub fn search_candidates(&self, field: &str, plaintext: &str) -> Result<Vec<String>, FieldError> {
        self.allowlist.check(field)?;
        let mut versions = self.keys.live_versions(Purpose::FieldEncryption)?;
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions
            .into_iter()
            .map(|v| Ok(self.encrypt_with_version(field, plaintext, Some(v))?.to_string()))
            .collect()
    }
}

fn subkeys(key: &DerivedKey) -> Result<Subkeys, FieldError> {
    let hk = Hkdf::<Sha256>::new(Some(SUBKEY_SALT), key.expose());
    let mut enc = Zeroizing::new([0u8; KEY_LEN]);
    let mut iv = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(ENC_INFO, &mut *enc)
        .and_then(|()| hk.expand(IV_INFO, &mut *iv))
        .map_err(|e| FieldError::Key(KeyError::Derivation(format!("hkdf: {e}"))))?;
    Ok(Subkeys { enc, iv })
}

fn synthetic_iv(subkeys: &Subkeys, field: &str, plaintext: &[u8]) -> Result<[u8; IV_LEN], FieldError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&*subkeys.iv)
        .map_err(|e| FieldError::Key(KeyError::Derivation(format!("hmac init: {e}"))))?;
    mac.update(field.as_bytes());
    mac.update(&[0]);
    mac.update(plaintext);
    let digest = mac.finalize().into_bytes();
    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&digest[..IV_LEN]);
    Ok(iv)
}

fn build_cipher(subkeys: &Subkeys) -> Result<Aes256Gcm, FieldError> {
    Aes256Gcm::new_from_slice(&*subkeys.enc)
        .map_err(|e| FieldError::Key(KeyError::Derivation(format!("cipher init failed: {e}"))))
}

fn associated_data(field: &str, version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(field.len() + 5);
    aad.extend_from_slice(field.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

#[cfg(test)]
pub(crate) fn test_cipher() -> FieldCipher {
    FieldCipher::new(
        Arc::new(crate::keys::test_manager()),
        FieldAllowlist::clinical_defaults(),
    )
}
