//! Time-to-live cache for short-lived, expensive-to-fetch values.
//!
//! One instance lives inside each [`B2Client`](crate::B2Client); nothing here is
//! process-global. Expired entries are evicted lazily: a lookup that finds an
//! expired entry removes it, and every insert sweeps the whole map. There is no
//! capacity limit.
//!
//! The map lock is never held while a fetch is running, so two callers missing
//! the same key may both hit the network. The later completion overwrites the
//! earlier one; readers never observe a half-written slot.

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

/// A cached value with its insertion time and lifetime
#[derive(Debug, Clone)]
pub struct CachedEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CachedEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

/// Thread-safe TTL cache
pub struct EphemeralCache<K, V> {
    entries: Mutex<HashMap<K, CachedEntry<V>>>,
}

impl<K, V> EphemeralCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live entry for `key`, or run `fetch` and cache its result.
    ///
    /// The TTL starts when `fetch` completes. A failed fetch stores nothing.
    pub async fn get_or_fetch<F, Fut>(&self, key: &K, ttl: Duration, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key) {
            trace!(?key, "cache hit");
            return Ok(value);
        }

        trace!(?key, "cache miss");
        let value = fetch().await?;
        self.insert(key.clone(), value.clone(), ttl);
        Ok(value)
    }

    /// Live value for `key`, evicting it if it has expired
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value, sweeping expired entries first
    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.lock();
        entries.retain(|_, entry| !entry.is_expired());
        entries.insert(key, CachedEntry::new(value, ttl));
    }

    /// Drop `key` so the next access fetches again
    pub fn invalidate(&self, key: &K) {
        if self.lock().remove(key).is_some() {
            trace!(?key, "cache entry invalidated");
        }
    }

    /// Remove every expired entry, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, CachedEntry<V>>> {
        // A panic while holding the lock cannot leave a partial entry behind
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K, V> Default for EphemeralCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
