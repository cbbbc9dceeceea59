//! Thread-safe map with per-entry time-to-live.
//!
//! Entries expire lazily: an expired entry is dropped by the next
//! operation that observes it. Every public operation has an `*_at`
//! variant taking an explicit clock so tests control time.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
    ttl: Duration,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Concurrent key/value map with per-entry leases.
pub struct TtlMap<K, V> {
    inner: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace, with a fresh lease of `ttl` from now.
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        self.insert_at(key, value, ttl, Instant::now());
    }

    pub fn insert_at(&self, key: K, value: V, ttl: Duration, now: Instant) {
        let mut map = self.inner.lock().expect("ttl map poisoned");
        map.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
                ttl,
            },
        );
    }

    /// Look up a live entry; expired entries are removed and missed.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut map = self.inner.lock().expect("ttl map poisoned");
        let expired = map.get(key).map(|entry| entry.is_expired(now))?;
        if expired {
            map.remove(key);
            return None;
        }
        map.get(key).map(|entry| entry.value.clone())
    }

    /// Whether a live entry exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Renew an entry's lease by its own TTL. Returns false when the
    /// entry is missing or already expired.
    pub fn touch(&self, key: &K) -> bool {
        self.touch_at(key, Instant::now())
    }

    pub fn touch_at(&self, key: &K, now: Instant) -> bool {
        let mut map = self.inner.lock().expect("ttl map poisoned");
        let Some(expired) = map.get(key).map(|entry| entry.is_expired(now)) else {
            return false;
        };
        if expired {
            map.remove(key);
            return false;
        }
        if let Some(entry) = map.get_mut(key) {
            entry.expires_at = now + entry.ttl;
        }
        true
    }

    /// Remove an entry, returning its value if it was still live.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.remove_at(key, Instant::now())
    }

    pub fn remove_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut map = self.inner.lock().expect("ttl map poisoned");
        let entry = map.remove(key)?;
        if entry.is_expired(now) {
            None
        } else {
            Some(entry.value)
        }
    }
}

impl<K, V> Default for TtlMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(40);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_present_before_expiry_absent_after() {
        let map = TtlMap::new();
        let t0 = Instant::now();

        map.insert_at("peer", 7u32, TTL, t0);

        assert_eq!(map.get_at(&"peer", t0 + secs(39)), Some(7));
        assert_eq!(map.get_at(&"peer", t0 + secs(41)), None);
    }

    #[test]
    fn test_touch_extends_lease() {
        let map = TtlMap::new();
        let t0 = Instant::now();

        map.insert_at("peer", 7u32, TTL, t0);
        assert!(map.touch_at(&"peer", t0 + secs(35)));

        // Lease now runs to t0+75.
        assert_eq!(map.get_at(&"peer", t0 + secs(74)), Some(7));
        assert_eq!(map.get_at(&"peer", t0 + secs(76)), None);
    }

    #[test]
    fn test_touch_missing_or_expired() {
        let map: TtlMap<&str, u32> = TtlMap::new();
        let t0 = Instant::now();

        assert!(!map.touch_at(&"ghost", t0));

        map.insert_at("peer", 1, TTL, t0);
        assert!(!map.touch_at(&"peer", t0 + secs(41)));
        // The expired entry was evicted by the failed touch.
        assert_eq!(map.get_at(&"peer", t0), None);
    }

    #[test]
    fn test_insert_supersedes_pending_expiry() {
        let map = TtlMap::new();
        let t0 = Instant::now();

        map.insert_at("peer", 1u32, TTL, t0);
        map.insert_at("peer", 2u32, TTL, t0 + secs(39));

        assert_eq!(map.get_at(&"peer", t0 + secs(60)), Some(2));
    }

    #[test]
    fn test_remove() {
        let map = TtlMap::new();
        let t0 = Instant::now();

        map.insert_at("peer", 1u32, TTL, t0);
        assert_eq!(map.remove_at(&"peer", t0 + secs(1)), Some(1));
        assert_eq!(map.get_at(&"peer", t0 + secs(1)), None);

        map.insert_at("peer", 2u32, TTL, t0);
        assert_eq!(map.remove_at(&"peer", t0 + secs(50)), None);
    }

    #[test]
    fn test_expired_get_evicts() {
        let map = TtlMap::new();
        let t0 = Instant::now();

        map.insert_at("peer", 1u32, TTL, t0);
        assert_eq!(map.get_at(&"peer", t0 + secs(41)), None);
        // Re-inserting after eviction works normally.
        map.insert_at("peer", 2u32, TTL, t0 + secs(41));
        assert_eq!(map.get_at(&"peer", t0 + secs(42)), Some(2));
    }
}
