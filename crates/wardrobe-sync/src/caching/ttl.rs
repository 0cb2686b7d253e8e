use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// An item saved in the [`TtlCache`].
#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    /// The point in time at which the value stops being valid upstream.
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    /// Whether the entry still has more than `buffer` of its lifetime left.
    fn is_servable(&self, now: Instant, buffer: Duration) -> bool {
        match self.expires_at.checked_sub(buffer) {
            Some(cutoff) => now < cutoff,
            None => false,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A key/value cache with explicit per-entry lifetimes.
///
/// Entries are only handed out while they have more than `buffer` of their lifetime left, so a
/// caller never receives a value that is about to expire before it gets used. Entries that fall
/// inside the buffer are evicted on access. Entries nobody asks for again are removed by
/// [`clean_expired`](Self::clean_expired), which is driven by a
/// [`CleanupTask`](super::CleanupTask).
///
/// Every [`clear`](Self::clear) starts a new generation. A value fetched before the clear can be
/// stored with [`set_unless_cleared`](Self::set_unless_cleared) so that it does not outlive it.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    /// Only changed while `entries` is locked.
    generation: AtomicU64,
    buffer: Duration,
}

impl<K, V> fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .entries
            .try_lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("TtlCache")
            .field("entries", &entries)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Creates an empty cache with the given eviction buffer.
    pub fn new(buffer: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            buffer,
        }
    }

    /// The current generation, to be passed to [`set_unless_cleared`](Self::set_unless_cleared).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Returns the cached value if it has more than the buffer of its lifetime left.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.is_servable(now, self.buffer) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores `value` for `ttl`, replacing whatever was cached for `key` before.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = self.make_entry(value, ttl);
        self.entries.lock().unwrap().insert(key, entry);
    }

    /// Like [`set`](Self::set), but drops `value` if the cache was cleared since `generation`.
    ///
    /// Returns whether the value was stored.
    pub fn set_unless_cleared(&self, key: K, value: V, ttl: Duration, generation: u64) -> bool {
        let entry = self.make_entry(value, ttl);
        let mut entries = self.entries.lock().unwrap();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        entries.insert(key, entry);
        true
    }

    fn make_entry(&self, value: V, ttl: Duration) -> CacheEntry<V> {
        if ttl <= self.buffer {
            tracing::warn!(
                ttl = %humantime::format_duration(ttl),
                buffer = %humantime::format_duration(self.buffer),
                "Caching a value whose lifetime does not exceed the eviction buffer",
            );
        }
        CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    /// Evicts a single entry, returning its value regardless of its remaining lifetime.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries
            .lock()
            .unwrap()
            .remove(key)
            .map(|entry| entry.value)
    }

    /// Removes every entry and starts a new generation.
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Removes all entries that are past their expiration time.
    ///
    /// Unlike [`get`](Self::get) this ignores the buffer. Returns the number of removed entries.
    pub fn clean_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// The number of stored entries, including ones that are no longer servable.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
