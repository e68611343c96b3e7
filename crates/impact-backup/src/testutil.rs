use std::sync::{Arc, OnceLock};

use impact_core::Document;
use impact_crypto::{DerivedKey, KdfParams, KeyManager, MasterSecret, Purpose};
use serde_json::Value;

pub(crate) fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// A fresh manager with the cheapest allowed KDF settings.
pub(crate) fn keys() -> Arc<KeyManager> {
    let secret = MasterSecret::new(b"backup-tests-master-secret".to_vec()).expect("secret");
    Arc::new(KeyManager::in_memory(secret, KdfParams::minimum()).expect("key manager"))
}

pub(crate) fn backup_key() -> DerivedKey {
    static KEYS: OnceLock<Arc<KeyManager>> = OnceLock::new();
    KEYS.get_or_init(keys)
        .derive_key(Purpose::BackupEncryption, None)
        .expect("backup key")
}
