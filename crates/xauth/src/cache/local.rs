use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

const MIN_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

/// Bounded in-process cache with per-entry TTL and LRU eviction.
///
/// Entries expire on an absolute deadline measured against the monotonic
/// clock; an expired entry is removed lazily on the `get` that observes it.
/// Capacity is enforced by evicting the least-recently-used entry on `set`.
///
/// Construction never panics: a zero capacity or TTL falls back to the
/// smallest valid value instead.
pub struct LocalCache<V> {
    entries: Mutex<LruCache<String, Entry<V>>>,
    default_ttl: Duration,
}

impl<V: Clone> LocalCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let default_ttl = if default_ttl.is_zero() { MIN_TTL } else { default_ttl };
        LocalCache {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl,
        }
    }

    /// Returns the cached value, refreshing its LRU position. An expired
    /// entry is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("Non-poisoned lock");
        let expired = match entries.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => return Some(entry.value.clone()),
            None => return None,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
            ttl: if ttl.is_zero() { self.default_ttl } else { ttl },
        };
        self.entries
            .lock()
            .expect("Non-poisoned lock")
            .put(key.into(), entry);
    }

    /// Removes the entry; returns whether one was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries
            .lock()
            .expect("Non-poisoned lock")
            .pop(key)
            .is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("Non-poisoned lock").clear();
    }

    /// Number of entries, including any whose TTL has elapsed but which have
    /// not been observed by a `get` yet.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("Non-poisoned lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> fmt::Debug for LocalCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock().expect("Non-poisoned lock");
        f.debug_struct("LocalCache")
            .field("len", &entries.len())
            .field("capacity", &entries.cap())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache = LocalCache::new(4, Duration::from_secs(60));
        cache.set("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_removed() {
        let cache = LocalCache::new(4, Duration::from_millis(10));
        cache.set("a", 1);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_per_entry_ttl_overrides_default() {
        let cache = LocalCache::new(4, Duration::from_millis(10));
        cache.set_with_ttl("long", 1, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get("long"), Some(1));
    }

    #[test]
    fn test_lru_eviction_on_set() {
        let cache = LocalCache::new(2, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        // Touch "a" so "b" becomes the LRU victim.
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_clear() {
        let cache = LocalCache::new(4, Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("b", 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_construction_clamps_misuse() {
        let cache = LocalCache::new(0, Duration::ZERO);
        cache.set("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        // Capacity was clamped to one entry.
        cache.set("b", 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.len(), 1);
    }
}
