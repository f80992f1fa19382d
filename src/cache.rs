//! Response cache for breakers created with caching enabled.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

struct CacheEntry<T> {
    value: T,
    expires_at: Option<Instant>,
}

/// Successful responses keyed by the caller's cache key.
pub(crate) struct ResponseCache<T> {
    entries: Mutex<AHashMap<String, CacheEntry<T>>>,
    ttl: Option<Duration>,
}

impl<T: Clone> ResponseCache<T> {
    pub(crate) fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
            ttl,
        }
    }

    /// Returns a live entry, evicting it if it has expired.
    pub(crate) fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) => entry
                .expires_at
                .is_some_and(|deadline| deadline <= Instant::now()),
            None => return None,
        };

        if expired {
            entries.remove(key);
            return None;
        }

        entries.get(key).map(|entry| entry.value.clone())
    }

    pub(crate) fn insert(&self, key: String, value: T) {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key, CacheEntry { value, expires_at });
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(Some(Duration::from_millis(20)));
        cache.insert("user:1".to_string(), 7u32);
        assert_eq!(cache.get("user:1"), Some(7));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("user:1"), None);
    }

    #[test]
    fn entries_without_ttl_persist_until_cleared() {
        let cache = ResponseCache::new(None);
        cache.insert(String::new(), "value");
        assert_eq!(cache.get(""), Some("value"));

        cache.clear();
        assert_eq!(cache.get(""), None);
    }
}
