//! Per-form sealing keys the local identity created.
//!
//! A private key is stored once under `sealkey/{formId}` and never leaves
//! this process. The full set is cached in memory because every inbound
//! response is trial-decrypted against all of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use whisperbox_protocol::sealing::FormKeyPair;

use crate::{
    error::EngineError,
    kv::{put_cbor, scan_cbor, KvStore},
};

const KEY_PREFIX: &str = "sealkey/";

pub struct KeyStore {
    kv:   Arc<dyn KvStore>,
    keys: BTreeMap<String, String>,
}

impl KeyStore {
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self, EngineError> {
        let keys = scan_cbor::<String>(kv.as_ref(), KEY_PREFIX)?
            .into_iter()
            .filter_map(|(key, secret)| {
                key.strip_prefix(KEY_PREFIX).map(|id| (id.to_string(), secret))
            })
            .collect::<BTreeMap<_, _>>();
        if !keys.is_empty() {
            tracing::info!("Loaded {} form sealing keys", keys.len());
        }
        Ok(Self { kv, keys })
    }

    pub fn generate() -> FormKeyPair {
        FormKeyPair::generate()
    }

    pub fn persist(&mut self, form_id: &str, private_key: &str) -> Result<(), EngineError> {
        if self.keys.contains_key(form_id) {
            return Err(EngineError::Duplicate(format!("sealing key for form {form_id}")));
        }
        put_cbor(self.kv.as_ref(), &format!("{KEY_PREFIX}{form_id}"), &private_key.to_string())?;
        self.keys.insert(form_id.to_string(), private_key.to_string());
        Ok(())
    }

    pub fn load(&self, form_id: &str) -> Result<&str, EngineError> {
        self.keys
            .get(form_id)
            .map(String::as_str)
            .ok_or_else(|| EngineError::KeyNotFound(form_id.to_string()))
    }

    pub fn contains(&self, form_id: &str) -> bool {
        self.keys.contains_key(form_id)
    }

    /// `(formId, privateKey)` for every form created here.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.keys.iter().map(|(id, key)| (id.as_str(), key.as_str()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn persist_then_load() {
        let mut keys = KeyStore::open(Arc::new(MemoryKv::new())).unwrap();
        let pair = KeyStore::generate();
        keys.persist("f1", &pair.private_key).unwrap();
        assert_eq!(keys.load("f1").unwrap(), pair.private_key);
        assert!(keys.contains("f1"));
    }

    #[test]
    fn second_key_for_same_form_rejected() {
        let mut keys = KeyStore::open(Arc::new(MemoryKv::new())).unwrap();
        keys.persist("f1", "aa").unwrap();
        assert!(matches!(keys.persist("f1", "bb"), Err(EngineError::Duplicate(_))));
        assert_eq!(keys.load("f1").unwrap(), "aa");
    }

    #[test]
    fn missing_key_is_not_found() {
        let keys = KeyStore::open(Arc::new(MemoryKv::new())).unwrap();
        assert!(matches!(keys.load("nope"), Err(EngineError::KeyNotFound(_))));
    }

    #[test]
    fn reloads_from_store_skipping_corruption() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        {
            let mut keys = KeyStore::open(kv.clone()).unwrap();
            keys.persist("f1", "aa").unwrap();
            keys.persist("f2", "bb").unwrap();
        }
        kv.set("sealkey/f3", &[0xff]).unwrap();

        let keys = KeyStore::open(kv).unwrap();
        assert_eq!(keys.iter().collect::<Vec<_>>(), vec![("f1", "aa"), ("f2", "bb")]);
    }
}
