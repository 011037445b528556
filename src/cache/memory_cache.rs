//! In-process cache backend
//!
//! Used when no cache endpoint is configured and by the test harness.
//! Entries expire lazily on read; a background sweep task reclaims entries
//! nobody reads again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::debug;
use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::{Cache, CacheError};

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory cache with per-entry TTL
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of live entries, expired ones included until swept
    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Start the periodic expiry sweep
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let swept = cache.sweep();
                if swept > 0 {
                    debug!("cache sweep removed {} expired entries", swept);
                }
            }
        })
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("k1", b"v1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), Some(b"v1".to_vec()));

        cache.delete("k1").await.unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_read_as_misses() {
        let cache = MemoryCache::new();
        cache.set("k1", b"v1", Duration::from_millis(10)).await.unwrap();
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_entries() {
        let cache = MemoryCache::new();
        cache.set("k1", b"v1", Duration::from_millis(10)).await.unwrap();
        cache.set("k2", b"v2", Duration::from_secs(60)).await.unwrap();
        time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.get("k2").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_prefix_scopes_to_prefix() {
        let cache = MemoryCache::new();
        cache.set("records:s1:a", b"1", Duration::from_secs(60)).await.unwrap();
        cache.set("records:s1:b", b"2", Duration::from_secs(60)).await.unwrap();
        cache.set("records:s2:a", b"3", Duration::from_secs(60)).await.unwrap();

        cache.delete_prefix("records:s1:").await.unwrap();
        assert_eq!(cache.get("records:s1:a").await.unwrap(), None);
        assert_eq!(cache.get("records:s1:b").await.unwrap(), None);
        assert_eq!(cache.get("records:s2:a").await.unwrap(), Some(b"3".to_vec()));
    }
}
