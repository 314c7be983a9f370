use crate::Error;
use std::collections::HashMap;
use std::sync::Mutex;

/// A single mutation within an atomic [`KeyStore::apply`] batch.
#[derive(Clone, Debug)]
pub enum StoreOp {
    /// Insert or overwrite a value.
    Put {
        /// Store key.
        key: String,
        /// Opaque value bytes.
        value: Vec<u8>,
    },
    /// Delete a value. Removing an absent key is not an error.
    Remove {
        /// Store key.
        key: String,
    },
}

/// Durable keyed storage for all cryptographic secrets and session state of
/// one local identity.
///
/// Missing keys are never an error: `get` returns `None` and `remove` is
/// idempotent. Every failure is [`Error::Storage`] and leaves no partial
/// state behind. `apply` commits a batch of mutations atomically, which is
/// what keeps multi-record updates (identity plus registration id, pre-key
/// records plus their index, session plus trust record) from ever being
/// half-written.
pub trait KeyStore: Send + Sync {
    /// Returns the value stored under `key`, or `None`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Stores `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Removes `key` if present.
    fn remove(&self, key: &str) -> Result<(), Error>;

    /// Applies every operation in `batch`, or none of them.
    fn apply(&self, batch: &[StoreOp]) -> Result<(), Error>;
}

/// In-memory [`KeyStore`] backed by a mutex-guarded map.
///
/// This is the store used in tests and by collaborators that snapshot the
/// full map into their own document storage.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, Error> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("key store lock poisoned".to_string()))
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        self.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Error> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn apply(&self, batch: &[StoreOp]) -> Result<(), Error> {
        // A single guard spans the whole batch, so the map never exposes a
        // partially applied state.
        let mut entries = self.lock()?;
        for op in batch {
            match op {
                StoreOp::Put { key, value } => {
                    entries.insert(key.clone(), value.clone());
                }
                StoreOp::Remove { key } => {
                    entries.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key_is_none_not_error() {
        let store = MemoryKeyStore::new();
        assert_eq!(store.get("absent").unwrap(), None);
        store.remove("absent").unwrap();
    }

    #[test]
    fn test_put_get_remove() {
        let store = MemoryKeyStore::new();
        store.put("k", b"v1").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"v1");

        store.put("k", b"v2").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), b"v2");

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_apply_batch() {
        let store = MemoryKeyStore::new();
        store.put("old", b"x").unwrap();

        store
            .apply(&[
                StoreOp::Put {
                    key: "a".to_string(),
                    value: b"1".to_vec(),
                },
                StoreOp::Put {
                    key: "b".to_string(),
                    value: b"2".to_vec(),
                },
                StoreOp::Remove {
                    key: "old".to_string(),
                },
            ])
            .unwrap();

        assert_eq!(store.get("a").unwrap().unwrap(), b"1");
        assert_eq!(store.get("b").unwrap().unwrap(), b"2");
        assert_eq!(store.get("old").unwrap(), None);
    }
}
