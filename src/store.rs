//! Key/value persistence for registry state.
//!
//! The provider registry keeps all of its state (registered rulesets, suite
//! configurations, sub-suite records, leases) in an external key/value store.
//! [`Store`] is the narrow contract the registry needs from that store;
//! [`MemoryStore`] implements it in-process for embedding and tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur when talking to the key/value store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A flat key/value store with prefix queries.
///
/// Keys are `/`-separated paths (e.g. `testrun/<suite_id>/suite/<id>`).
/// All operations are synchronous; a networked backend blocks its caller.
pub trait Store: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn read(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write `value` under `key`, replacing any previous value.
    fn write(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Write `value` under `key` only if the key is currently absent.
    ///
    /// Returns whether the write happened. This is the primitive the
    /// per-suite lease is built on.
    fn write_if_absent(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Delete `key`. Deleting an absent key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Read all entries whose key starts with `prefix`, in key order.
    fn read_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>>;

    /// Delete all entries whose key starts with `prefix`.
    fn delete_prefix(&self, prefix: &str) -> StoreResult<()>;
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Store for MemoryStore {
    fn read(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn write_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn read_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, String)>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_delete() {
        let store = MemoryStore::new();
        store.write("a/b", "1").unwrap();
        assert_eq!(store.read("a/b").unwrap().as_deref(), Some("1"));

        store.delete("a/b").unwrap();
        assert_eq!(store.read("a/b").unwrap(), None);
        // Deleting again is fine.
        store.delete("a/b").unwrap();
    }

    #[test]
    fn test_write_if_absent() {
        let store = MemoryStore::new();
        assert!(store.write_if_absent("lease", "x").unwrap());
        assert!(!store.write_if_absent("lease", "y").unwrap());
        assert_eq!(store.read("lease").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn test_prefix_queries() {
        let store = MemoryStore::new();
        store.write("testrun/s1/suite/a", "1").unwrap();
        store.write("testrun/s1/suite/b", "2").unwrap();
        store.write("testrun/s2/suite/c", "3").unwrap();

        let entries = store.read_prefix("testrun/s1/").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "testrun/s1/suite/a");

        store.delete_prefix("testrun/s1/").unwrap();
        assert!(store.read_prefix("testrun/s1/").unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }
}
