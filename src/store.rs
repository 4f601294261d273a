//! In-memory key-value storage shared by the ordering engines.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Thread-safe key-value store held by each replica.
///
/// The ordering engines apply delivered write operations here, so the
/// contents are always a function of the sequence of deliveries on this
/// replica. Operations are individually atomic under a single mutex;
/// there is no transactional grouping.
#[derive(Default)]
pub struct KvStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
        }
    }

    /// Retrieves the current value for a key, or `None` if absent.
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn put(&self, key: String, value: String) {
        self.data.lock().unwrap().insert(key, value);
    }

    /// Removes the entry for a key. Absent keys are a no-op.
    pub fn delete(&self, key: &str) {
        self.data.lock().unwrap().remove(key);
    }

    /// Returns a snapshot of all key-value pairs.
    ///
    /// Clones the map so the lock is not held during the caller's
    /// iteration. Used for the shutdown printout and test assertions.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.data.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_on_absent_key_is_none() {
        let store = KvStore::new();
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn put_overwrites_existing_value() {
        let store = KvStore::new();
        store.put("x".into(), "a".into());
        store.put("x".into(), "b".into());
        assert_eq!(store.get("x"), Some("b".into()));
    }

    #[test]
    fn delete_removes_entry_and_tolerates_absent_keys() {
        let store = KvStore::new();
        store.put("x".into(), "a".into());
        store.delete("x");
        assert_eq!(store.get("x"), None);
        store.delete("x");
        assert!(store.dump().is_empty());
    }

    #[test]
    fn dump_reflects_applied_operations() {
        let store = KvStore::new();
        store.put("a".into(), "1".into());
        store.put("b".into(), "2".into());
        store.delete("a");
        let dump = store.dump();
        assert_eq!(dump.len(), 1);
        assert_eq!(dump.get("b"), Some(&"2".to_string()));
    }
}
