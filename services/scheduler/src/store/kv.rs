//! Key-value backend seam.

use super::StoreError;

/// Ordered string key-value storage.
///
/// Implementations must be safe to share across threads; the scheduler
/// only calls them from its own task, but tests and tooling read alongside.
pub trait KvStore: Send + Sync {
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Deletes every key starting with `prefix`. Returns how many went.
    fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Every entry whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}
