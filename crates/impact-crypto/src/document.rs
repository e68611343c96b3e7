//! Record-level helpers: apply the field cipher to every allowlisted value
//! of a document, including nested objects such as `demographics`.

use std::collections::BTreeSet;

use impact_core::Document;
use serde_json::Value;

use crate::{
    error::FieldError,
    field::{is_encrypted, EncryptedField, FieldAllowlist, FieldCipher},
};

impl FieldCipher {
    /// Encrypt allowlisted values that are still plaintext. Numbers are
    /// encrypted in their decimal form; nulls are left alone. Safe to re-run.
    /// Returns the number of values changed.
    pub fn encrypt_document(&self, doc: &mut Document) -> Result<usize, FieldError> {
        visit(doc, self.allowlist(), &mut |field, value| {
            let plaintext = match value {
                Value::String(s) if !is_encrypted(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return Ok(false),
            };
            *value = Value::String(self.encrypt_str(field, &plaintext)?);
            Ok(true)
        })
    }

    /// Decrypt every encrypted allowlisted value in place.
    pub fn decrypt_document(&self, doc: &mut Document) -> Result<usize, FieldError> {
        visit(doc, self.allowlist(), &mut |field, value| match value {
            Value::String(s) if is_encrypted(s) => {
                *value = Value::String(self.decrypt_str(field, s)?);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    /// Move every allowlisted value encrypted under an older key version to
    /// the current version. Returns the number of values rewritten.
    pub fn reencrypt_document(&self, doc: &mut Document) -> Result<usize, FieldError> {
        let current = self.current_version()?;
        visit(doc, self.allowlist(), &mut |field, value| {
            let Value::String(s) = value else {
                return Ok(false);
            };
            if !is_encrypted(s) {
                return Ok(false);
            }
            let parsed: EncryptedField = s.parse()?;
            if parsed.key_version == current {
                return Ok(false);
            }
            let plaintext = self.decrypt(field, &parsed)?;
            *value = Value::String(self.encrypt_str(field, &plaintext)?);
            Ok(true)
        })
    }
}

/// Key versions referenced by any encrypted value in the document, wherever
/// it sits. Used to prove a version unused before retiring it.
pub fn document_key_versions(doc: &Document) -> BTreeSet<u32> {
    let mut versions = BTreeSet::new();
    for value in doc.values() {
        collect_versions(value, &mut versions);
    }
    versions
}

fn collect_versions(value: &Value, out: &mut BTreeSet<u32>) {
    match value {
        Value::String(s) if is_encrypted(s) => {
            if let Ok(field) = s.parse::<EncryptedField>() {
                out.insert(field.key_version);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_versions(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_versions(v, out)),
        _ => {}
    }
}

type Visitor<'a> = dyn FnMut(&str, &mut Value) -> Result<bool, FieldError> + 'a;

fn visit(
    doc: &mut Document,
    allowlist: &FieldAllowlist,
    f: &mut Visitor<'_>,
) -> Result<usize, FieldError> {
    let mut changed = 0;
    for (key, value) in doc.iter_mut() {
        if allowlist.contains(key) {
            if f(key, value)? {
                changed += 1;
            }
            continue;
        }
        match value {
            Value::Object(nested) => changed += visit(nested, allowlist, f)?,
            Value::Array(items) => {
                for item in items {
                    if let Value::Object(nested) = item {
                        changed += visit(nested, allowlist, f)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(changed)
}
