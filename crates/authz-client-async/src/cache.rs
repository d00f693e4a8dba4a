//! Decision cache
//!
//! Bounded LRU store of previously answered checks. A hit resolves a check
//! without a network round trip. Entries carrying a TTL are dropped on the first
//! lookup after they expire.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Instant;
use tracing::debug;

use crate::decision::{CheckKey, CheckResult};

/// Cached decision
#[derive(Clone, Debug)]
struct CacheEntry {
    result: CheckResult,
    /// When this entry expires, if the service gave it a TTL
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// LRU decision cache with a capacity fixed at construction
///
/// Capacity 0 disables the cache: every lookup misses and inserts are no-ops.
#[derive(Debug)]
pub struct DecisionCache {
    inner: Option<LruCache<CheckKey, CacheEntry>>,
}

impl DecisionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    /// Look up a decision, refreshing its recency on a hit
    pub fn lookup(&mut self, key: &CheckKey) -> Option<CheckResult> {
        let inner = self.inner.as_mut()?;
        let entry = inner.get(key)?;
        if entry.is_expired(Instant::now()) {
            debug!(key_digest = %key.digest(), "cache entry expired");
            inner.pop(key);
            return None;
        }
        Some(entry.result.clone())
    }

    /// Store a decision, evicting the least recently used entry when full
    ///
    /// Results with a zero TTL are never stored.
    pub fn insert(&mut self, key: CheckKey, result: CheckResult) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        if result.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return;
        }
        let entry = CacheEntry {
            expires_at: result.ttl.map(|ttl| Instant::now() + ttl),
            result,
        };
        if let Some((displaced, _)) = inner.push(key, entry) {
            // push also hands back the old value when the key was only updated
            if !inner.contains(&displaced) {
                debug!(key_digest = %displaced.digest(), "cache capacity reached, evicted entry");
            }
        }
    }

    /// Remove an entry (e.g. on invalidation)
    pub fn remove(&mut self, key: &CheckKey) {
        if let Some(inner) = self.inner.as_mut() {
            inner.pop(key);
        }
    }

    pub fn clear(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.clear();
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.cap().get())
    }

    /// Get the number of entries in the cache
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(user: &str) -> CheckKey {
        CheckKey::new("client", "session", user.to_string(), "privilege").unwrap()
    }

    #[test]
    fn test_cache_insert_lookup() {
        let mut cache = DecisionCache::new(4);

        cache.insert(key("alice"), CheckResult::allow().with_metadata("token"));

        let result = cache.lookup(&key("alice")).expect("should exist");
        assert!(result.is_allowed());
        assert_eq!(result.metadata.as_deref(), Some("token"));
        assert!(cache.lookup(&key("bob")).is_none());
    }

    #[test]
    fn test_capacity_one_evicts_first_key() {
        let mut cache = DecisionCache::new(1);

        cache.insert(key("alice"), CheckResult::allow());
        cache.insert(key("bob"), CheckResult::deny());

        assert!(cache.lookup(&key("alice")).is_none());
        assert_eq!(cache.lookup(&key("bob")), Some(CheckResult::deny()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lookup_refreshes_recency() {
        let mut cache = DecisionCache::new(2);

        cache.insert(key("alice"), CheckResult::allow());
        cache.insert(key("bob"), CheckResult::allow());
        // alice becomes most recently used, so bob is the one to go
        assert!(cache.lookup(&key("alice")).is_some());
        cache.insert(key("carol"), CheckResult::allow());

        assert!(cache.lookup(&key("alice")).is_some());
        assert!(cache.lookup(&key("bob")).is_none());
        assert!(cache.lookup(&key("carol")).is_some());
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut cache = DecisionCache::new(0);

        cache.insert(key("alice"), CheckResult::allow());

        assert!(cache.lookup(&key("alice")).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 0);
    }

    #[test]
    fn test_cache_expiry() {
        let mut cache = DecisionCache::new(4);

        // Put with very short TTL
        cache.insert(
            key("alice"),
            CheckResult::allow().with_ttl(Duration::from_millis(1)),
        );
        assert_eq!(cache.len(), 1);

        // Wait for expiry
        std::thread::sleep(Duration::from_millis(5));

        // Should be expired and evicted eagerly
        assert!(cache.lookup(&key("alice")).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_zero_ttl_is_not_stored() {
        let mut cache = DecisionCache::new(4);

        cache.insert(key("alice"), CheckResult::allow().with_ttl(Duration::ZERO));

        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_remove_and_clear() {
        let mut cache = DecisionCache::new(4);

        cache.insert(key("alice"), CheckResult::allow());
        cache.insert(key("bob"), CheckResult::allow());

        cache.remove(&key("alice"));
        assert!(cache.lookup(&key("alice")).is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 4);
    }
}
