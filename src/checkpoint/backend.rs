//! Key-value persistence backend.
//!
//! The checkpoint store is generic over this trait. The in-memory
//! implementation is always available; durable stores plug in behind the
//! same interface.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// A keyed byte store with per-entry TTLs.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Fetches the value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value` at `key`. A `ttl` of `None` keeps the entry until
    /// deleted.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Removes the entry at `key`, if any.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists all live keys starting with `prefix`.
    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically replaces the value at `key` when the current value
    /// equals `expected` (`None` meaning absent). Returns whether the
    /// swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`KeyValueBackend`] with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired entry. Expiry is otherwise lazy, checked on
    /// read; long-idle nodes can call this periodically.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    /// Number of live entries (expired entries may still be counted
    /// until the next sweep).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if the backend holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| !e.is_expired(Instant::now()))
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let current = entries.get(key).filter(|e| !e.is_expired(now));
        let matches = match (current, expected) {
            (None, None) => true,
            (Some(e), Some(want)) => e.value == want,
            _ => false,
        };
        if matches {
            let expires_at = entries.get(key).and_then(|e| e.expires_at);
            entries.insert(
                key.to_string(),
                Entry {
                    value: new,
                    expires_at,
                },
            );
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        backend.put("k1", b"v1".to_vec(), None).await.unwrap();
        assert_eq!(backend.get("k1").await.unwrap(), Some(b"v1".to_vec()));

        backend.delete("k1").await.unwrap();
        assert_eq!(backend.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();
        backend
            .put("short", b"x".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(backend.get("short").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(backend.get("short").await.unwrap(), None);
        assert_eq!(backend.sweep().await, 1);
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let backend = MemoryBackend::new();
        backend.put("task:1", b"a".to_vec(), None).await.unwrap();
        backend.put("task:2", b"b".to_vec(), None).await.unwrap();
        backend.put("thread:1", b"c".to_vec(), None).await.unwrap();

        let mut keys = backend.list_by_prefix("task:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["task:1", "task:2"]);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let backend = MemoryBackend::new();

        // Insert-if-absent.
        assert!(backend
            .compare_and_swap("k", None, b"v1".to_vec())
            .await
            .unwrap());
        // Absent expectation now fails.
        assert!(!backend
            .compare_and_swap("k", None, b"v2".to_vec())
            .await
            .unwrap());
        // Matching expectation swaps.
        assert!(backend
            .compare_and_swap("k", Some(b"v1"), b"v2".to_vec())
            .await
            .unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }
}
