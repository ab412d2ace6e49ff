//! Size-bounded LRU cache for decoded values.
//!
//! Size is measured in caller-defined units via a weigher (for images, the
//! decoded pixel footprint), never by any serialized length.

use std::fmt;

use lru::LruCache;
use parking_lot::Mutex;

type Weigher<V> = Box<dyn Fn(&str, &V) -> usize + Send + Sync>;

/// Thread-safe LRU cache bounded by total weight.
///
/// `get` and `put` both refresh recency. Values are handed out by clone, so
/// `V` is typically an `Arc` or another cheap handle.
pub struct MemoryCache<V> {
    inner: Mutex<Inner<V>>,
    weigher: Weigher<V>,
}

struct Inner<V> {
    entries: LruCache<String, Weighted<V>>,
    size: usize,
    max_size: usize,
}

struct Weighted<V> {
    value: V,
    weight: usize,
}

impl<V: Clone> MemoryCache<V> {
    pub fn new(max_size: usize, weigher: impl Fn(&str, &V) -> usize + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: LruCache::unbounded(), size: 0, max_size: max_size.max(1) }),
            weigher: Box::new(weigher),
        }
    }

    /// Cache sized to `fraction` of `budget_bytes`.
    pub fn with_fraction(
        budget_bytes: u64, fraction: f64, weigher: impl Fn(&str, &V) -> usize + Send + Sync + 'static,
    ) -> Self {
        let max_size = (budget_bytes as f64 * fraction.clamp(0.0, 1.0)) as usize;
        Self::new(max_size, weigher)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert `value`, returning the value it replaced.
    ///
    /// A value heavier than the whole cache is not retained.
    pub fn put(&self, key: &str, value: V) -> Option<V> {
        let weight = (self.weigher)(key, &value).max(1);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let previous = inner.entries.pop(key).map(|old| {
            inner.size -= old.weight;
            old.value
        });

        if weight > inner.max_size {
            tracing::debug!(key, weight, max_size = inner.max_size, "value too large for memory cache");
            return previous;
        }

        inner.entries.put(key.to_string(), Weighted { value, weight });
        inner.size += weight;

        while inner.size > inner.max_size {
            match inner.entries.pop_lru() {
                Some((evicted, entry)) => {
                    inner.size -= entry.weight;
                    tracing::debug!(key = %evicted, weight = entry.weight, "evicted from memory cache");
                }
                None => break,
            }
        }

        previous
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let entry = inner.entries.pop(key)?;
        inner.size -= entry.weight;
        Some(entry.value)
    }

    pub fn evict_all(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.size = 0;
    }

    /// Present without refreshing recency.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Total weight of resident values.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryCache")
            .field("len", &inner.entries.len())
            .field("size", &inner.size)
            .field("max_size", &inner.max_size)
            .finish()
    }
}
