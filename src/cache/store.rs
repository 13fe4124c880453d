//! TTL store with lazy eviction.
//!
//! Entries carry an absolute expiry. Reads past the expiry remove the entry
//! and report a miss; there is no capacity bound.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct TtlStore<V> {
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V: Clone> TtlStore<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the value if present and not expired; expired entries are removed
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_fresh(now) {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }

        // Shard guard is released above; re-check under the write lock so a
        // concurrent fresh `set` is not thrown away.
        if self
            .entries
            .remove_if(key, |_, entry| !entry.is_fresh(now))
            .is_some()
        {
            debug!(cache_key = key, "Evicted expired entry on read");
        }
        None
    }

    /// Insert or overwrite; the entry expires `ttl` from now
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        if ttl.is_zero() {
            debug_assert!(false, "cache TTL must be greater than zero");
            warn!(cache_key = key, "Refusing to cache with zero TTL");
            return;
        }

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Remove every key starting with `prefix`, returning how many were removed
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        before.saturating_sub(self.entries.len())
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for TtlStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_before_and_after_ttl() {
        let store = TtlStore::new();
        store.set("diseases.uz", vec!["Gripp"], Duration::from_secs(120));

        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(store.get("diseases.uz"), Some(vec!["Gripp"]));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("diseases.uz"), None);
        // expired read removes the entry
        assert!(!store.contains_key("diseases.uz"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_refreshes_expiry() {
        let store = TtlStore::new();
        store.set("k", 1, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        store.set("k", 2, Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("k"), Some(2));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = TtlStore::new();
        store.set("k", 1, Duration::from_secs(10));
        store.delete("k");
        store.delete("k");
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_by_prefix_scope() {
        let store = TtlStore::new();
        let ttl = Duration::from_secs(60);
        store.set("diseases.list.uz", 1, ttl);
        store.set("diseases.item.42", 2, ttl);
        store.set("questions.list", 3, ttl);

        assert_eq!(store.delete_by_prefix("diseases"), 2);
        assert_eq!(store.get("questions.list"), Some(3));
        assert_eq!(store.delete_by_prefix("diseases"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_fresh_entries() {
        let store = TtlStore::new();
        store.set("short", 1, Duration::from_secs(5));
        store.set("long", 2, Duration::from_secs(50));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long"), Some(2));
    }
}
