//! In-memory backend for tests and throwaway runs.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{KvStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, String>>,
    /// Keys in write order, for asserting write coalescing.
    writes: Mutex<Vec<String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>, StoreError> {
        self.entries.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `put` calls on keys starting with `prefix`.
    pub fn writes_with_prefix(&self, prefix: &str) -> usize {
        self.writes
            .lock()
            .map(|w| w.iter().filter(|k| k.starts_with(prefix)).count())
            .unwrap_or(0)
    }
}

impl KvStore for MemoryKv {
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(key.to_string());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .entries()?
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let kv = MemoryKv::new();
        kv.put("/slots/web/1-web", "b").unwrap();
        kv.put("/slots/web/0-web", "a").unwrap();
        kv.put("/slots/web-api/0-web-api", "c").unwrap();
        kv.put("/tasks/web/0-web/x", "d").unwrap();

        let keys: Vec<String> = kv
            .scan_prefix("/slots/web/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["/slots/web/0-web", "/slots/web/1-web"]);
    }

    #[test]
    fn test_delete_prefix() {
        let kv = MemoryKv::new();
        kv.put("/tasks/web/0-web/a", "1").unwrap();
        kv.put("/tasks/web/0-web/b", "2").unwrap();
        kv.put("/tasks/web/1-web/c", "3").unwrap();

        assert_eq!(kv.delete_prefix("/tasks/web/0-web/").unwrap(), 2);
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.writes_with_prefix("/tasks/"), 3);
    }
}
