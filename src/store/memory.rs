//! In-memory store backend
//!
//! A `HashMap` behind a `parking_lot::RwLock`. Used for scratch indices
//! and tests; shares the exact contract (and key namespace) of the file
//! backend, so a test exercising commit plumbing against `MemStore` is
//! exercising the same code paths production runs against a directory.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;

use super::KvStore;

#[derive(Default)]
pub struct MemStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys (test helper).
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }

    fn multi_put(&self, batch: Vec<(String, Vec<u8>)>) -> Result<()> {
        let mut entries = self.entries.write();
        for (k, v) in batch {
            entries.insert(k, v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemStore::new();
        store.put("a", vec![1, 2, 3]).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(vec![1, 2, 3]));
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_multi_put() {
        let store = MemStore::new();
        store
            .multi_put(vec![("x".into(), vec![0]), ("y".into(), vec![1])])
            .unwrap();
        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["x", "y"]);
    }
}
