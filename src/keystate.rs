//! Sled-based PoET key state store
//!
//! One database per local validator identity, mapping a PoET public key to
//! the sealed key material behind it. This is the only persistent mutable
//! resource in the consensus core: entries are created on enrollment or
//! refresh, mutated only to mark retirement, and never deleted except on a
//! local reset.
//!
//! Handles are owned by an explicit [`KeyStateStoreMap`] constructed once by
//! the embedding process; concurrent opens of the same identity return the
//! same handle rather than reopening storage.

use crate::crypto::PublicKey;
use crate::types::ValidatorId;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum KeyStateError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("no key state for PoET public key")]
    NotFound,
    #[error("invalid key state: {0}")]
    Invalid(String),
    #[error("cannot activate a key with no stored state")]
    ActiveKeyMissing,
}

/// State persisted for one PoET key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    /// Base64 blob only the enclave oracle can unseal
    pub sealed_signup_data: String,
    /// True once the key hit its claim limit and replacement signup
    /// information has been created
    pub has_been_refreshed: bool,
    /// Chain-head nonce recorded at enrollment, used to detect a
    /// registration that never committed
    pub signup_nonce: String,
}

impl KeyState {
    fn check(&self) -> Result<(), KeyStateError> {
        if self.sealed_signup_data.is_empty() {
            return Err(KeyStateError::Invalid(
                "sealed signup data must not be empty".into(),
            ));
        }
        // Not a full unseal, but at least require well-formed base64
        BASE64
            .decode(&self.sealed_signup_data)
            .map_err(|e| KeyStateError::Invalid(format!("sealed signup data: {e}")))?;
        Ok(())
    }
}

const ACTIVE_KEY: &[u8] = b"active_key";

/// Well-formed sealed-data stand-in for registry keys we hold no material
/// for. Never unsealable; always stored with `has_been_refreshed = true`.
pub fn placeholder_sealed_data() -> String {
    BASE64.encode(b"no sealed signup data")
}

/// Key state storage for one validator identity.
pub struct KeyStateStore {
    db: Db,
    keys: Tree,
    meta: Tree,
    /// Serializes compound mutations (check-then-set on the active
    /// pointer, delete-and-clear).
    write_lock: Mutex<()>,
}

impl KeyStateStore {
    fn open(path: &Path) -> Result<Self, KeyStateError> {
        let db = sled::open(path)?;
        let keys = db.open_tree("key_state")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            keys,
            meta,
            write_lock: Mutex::new(()),
        })
    }

    #[cfg(test)]
    pub(crate) fn temporary() -> Result<Self, KeyStateError> {
        let db = sled::Config::new().temporary(true).open()?;
        let keys = db.open_tree("key_state")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            keys,
            meta,
            write_lock: Mutex::new(()),
        })
    }

    /// Store or update state for a PoET public key.
    pub fn put(&self, poet_public_key: &PublicKey, state: &KeyState) -> Result<(), KeyStateError> {
        state.check()?;
        let _guard = self.write_lock.lock().expect("key state lock");
        self.keys
            .insert(poet_public_key.as_bytes(), bincode::serialize(state)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get(&self, poet_public_key: &PublicKey) -> Result<KeyState, KeyStateError> {
        let value = self
            .keys
            .get(poet_public_key.as_bytes())?
            .ok_or(KeyStateError::NotFound)?;
        let state: KeyState = bincode::deserialize(&value)?;
        state.check()?;
        Ok(state)
    }

    pub fn contains(&self, poet_public_key: &PublicKey) -> Result<bool, KeyStateError> {
        Ok(self.keys.contains_key(poet_public_key.as_bytes())?)
    }

    /// Remove state for a key; clears the active pointer if it referenced
    /// the removed key. Missing keys are ignored.
    pub fn remove(&self, poet_public_key: &PublicKey) -> Result<(), KeyStateError> {
        let _guard = self.write_lock.lock().expect("key state lock");
        self.keys.remove(poet_public_key.as_bytes())?;
        if let Some(active) = self.meta.get(ACTIVE_KEY)? {
            if active.as_ref() == poet_public_key.as_bytes() {
                self.meta.remove(ACTIVE_KEY)?;
            }
        }
        self.db.flush()?;
        Ok(())
    }

    /// The key the publisher currently claims with, if any.
    pub fn active_key(&self) -> Result<Option<PublicKey>, KeyStateError> {
        match self.meta.get(ACTIVE_KEY)? {
            None => Ok(None),
            Some(raw) => PublicKey::try_from_slice(&raw)
                .map(Some)
                .map_err(|_| KeyStateError::Invalid("stored active key is malformed".into())),
        }
    }

    /// Point the active key at an existing entry, or clear it with `None`.
    pub fn set_active_key(&self, key: Option<&PublicKey>) -> Result<(), KeyStateError> {
        let _guard = self.write_lock.lock().expect("key state lock");
        match key {
            None => {
                self.meta.remove(ACTIVE_KEY)?;
            }
            Some(public_key) => {
                if !self.keys.contains_key(public_key.as_bytes())? {
                    return Err(KeyStateError::ActiveKeyMissing);
                }
                self.meta.insert(ACTIVE_KEY, public_key.as_bytes().as_slice())?;
            }
        }
        self.db.flush()?;
        Ok(())
    }

    /// All PoET public keys with stored state.
    pub fn poet_public_keys(&self) -> Result<Vec<PublicKey>, KeyStateError> {
        let mut keys = Vec::new();
        for item in self.keys.iter() {
            let (raw, _) = item?;
            keys.push(
                PublicKey::try_from_slice(&raw)
                    .map_err(|_| KeyStateError::Invalid("stored key is malformed".into()))?,
            );
        }
        Ok(keys)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Handle table: one [`KeyStateStore`] per validator identity, opened once.
pub struct KeyStateStoreMap {
    data_dir: PathBuf,
    stores: Mutex<HashMap<ValidatorId, Arc<KeyStateStore>>>,
}

impl KeyStateStoreMap {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or return the already-open) store for `validator_id`.
    pub fn open(&self, validator_id: &ValidatorId) -> Result<Arc<KeyStateStore>, KeyStateError> {
        let mut stores = self.stores.lock().expect("store table lock");
        if let Some(store) = stores.get(validator_id) {
            return Ok(store.clone());
        }

        let file_name = format!("poet-key-state-{}", hex::encode(&validator_id[..4]));
        let path = self.data_dir.join(file_name);
        debug!(path = %path.display(), "opening key state store");
        let store = Arc::new(KeyStateStore::open(&path)?);
        stores.insert(*validator_id, store.clone());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(tag: &str) -> KeyState {
        KeyState {
            sealed_signup_data: BASE64.encode(format!("sealed-{tag}")),
            has_been_refreshed: false,
            signup_nonce: format!("nonce-{tag}"),
        }
    }

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes(&[byte; 32])
    }

    #[test]
    fn test_put_get_round_trip() {
        let store = KeyStateStore::temporary().unwrap();
        let state = sample_state("a");
        store.put(&key(1), &state).unwrap();
        assert_eq!(store.get(&key(1)).unwrap(), state);
        assert!(store.contains(&key(1)).unwrap());
        assert!(!store.contains(&key(2)).unwrap());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let store = KeyStateStore::temporary().unwrap();
        assert!(matches!(store.get(&key(1)), Err(KeyStateError::NotFound)));
    }

    #[test]
    fn test_rejects_invalid_sealed_data() {
        let store = KeyStateStore::temporary().unwrap();
        let bad = KeyState {
            sealed_signup_data: "not base64 !!!".into(),
            has_been_refreshed: false,
            signup_nonce: "n".into(),
        };
        assert!(matches!(
            store.put(&key(1), &bad),
            Err(KeyStateError::Invalid(_))
        ));

        let empty = KeyState {
            sealed_signup_data: String::new(),
            has_been_refreshed: false,
            signup_nonce: "n".into(),
        };
        assert!(matches!(
            store.put(&key(1), &empty),
            Err(KeyStateError::Invalid(_))
        ));
    }

    #[test]
    fn test_active_key_must_exist() {
        let store = KeyStateStore::temporary().unwrap();
        assert!(matches!(
            store.set_active_key(Some(&key(1))),
            Err(KeyStateError::ActiveKeyMissing)
        ));

        store.put(&key(1), &sample_state("a")).unwrap();
        store.set_active_key(Some(&key(1))).unwrap();
        assert_eq!(store.active_key().unwrap(), Some(key(1)));

        store.set_active_key(None).unwrap();
        assert_eq!(store.active_key().unwrap(), None);
    }

    #[test]
    fn test_remove_clears_active_pointer() {
        let store = KeyStateStore::temporary().unwrap();
        store.put(&key(1), &sample_state("a")).unwrap();
        store.set_active_key(Some(&key(1))).unwrap();

        store.remove(&key(1)).unwrap();
        assert_eq!(store.active_key().unwrap(), None);
        assert!(!store.contains(&key(1)).unwrap());

        // Removing again is a no-op
        store.remove(&key(1)).unwrap();
    }

    #[test]
    fn test_enumerate_keys() {
        let store = KeyStateStore::temporary().unwrap();
        store.put(&key(1), &sample_state("a")).unwrap();
        store.put(&key(2), &sample_state("b")).unwrap();

        let mut keys = store.poet_public_keys().unwrap();
        keys.sort_by_key(|k| k.0);
        assert_eq!(keys, vec![key(1), key(2)]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_map_returns_same_handle() {
        let dir = std::env::temp_dir().join(format!("poet-keystate-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let map = KeyStateStoreMap::new(&dir);
        let a = map.open(&[7u8; 32]).unwrap();
        let b = map.open(&[7u8; 32]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
