//! LRU + TTL Cache Implementation

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Deadline for TTLs too large to add to the current instant (about 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Observability counters for a cache instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Lookups that returned a live value
    pub hits: u64,
    /// Lookups that found nothing or an expired value
    pub misses: u64,
    /// Entries removed by LRU pressure or TTL expiry
    pub evictions: u64,
    /// Current number of stored entries
    pub size: usize,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    /// Position in the recency order; larger is more recent
    order: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// order -> key, oldest first
    recency: BTreeMap<u64, String>,
    next_order: u64,
    stats: CacheStats,
}

impl<V> CacheInner<V> {
    fn touch(&mut self, key: &str) {
        let order = self.next_order;
        self.next_order += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.order);
            entry.order = order;
            self.recency.insert(order, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.order);
        self.stats.size = self.entries.len();
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        self.stats.evictions += 1;
        self.stats.size = self.entries.len();
        Some(key)
    }
}

/// Bounded LRU cache keyed by opaque strings with per-entry expiry.
///
/// All methods take `&self`; the cache is the only owner of its entries and
/// serializes access internally, so it can be shared behind an `Arc`.
pub struct ResultCache<V> {
    max_size: usize,
    default_ttl: Duration,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> ResultCache<V> {
    /// Create a cache holding at most `max_size` entries (minimum 1)
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            default_ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_order: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<V>> {
        // A panic while holding the lock cannot leave the maps half-updated
        // in a way that breaks later calls, so recover from poisoning.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a key, refreshing its recency when the value is still live.
    ///
    /// An expired entry counts as a miss and is dropped on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => now >= entry.expires_at,
        };

        if expired {
            inner.remove(key);
            inner.stats.evictions += 1;
            inner.stats.misses += 1;
            trace!("Cache entry {} expired", key);
            return None;
        }

        inner.touch(key);
        inner.stats.hits += 1;
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert with the cache-wide default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL, evicting the least recently used entry
    /// if the cache is full.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut inner = self.lock();
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE);

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            inner.touch(&key);
            return;
        }

        if inner.entries.len() >= self.max_size {
            if let Some(evicted) = inner.evict_lru() {
                debug!("Cache full ({}), evicted {}", self.max_size, evicted);
            }
        }

        let order = inner.next_order;
        inner.next_order += 1;
        inner.recency.insert(order, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                order,
            },
        );
        inner.stats.size = inner.entries.len();
    }

    /// Remove a key, returning its value if it was present
    pub fn remove(&self, key: &str) -> Option<V> {
        self.lock().remove(key).map(|entry| entry.value)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
            inner.stats.evictions += 1;
        }
        expired.len()
    }

    /// Remove all entries and reset the counters
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
        inner.stats = CacheStats::default();
    }

    /// Number of stored entries (expired ones included until touched)
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}
