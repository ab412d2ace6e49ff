use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::request::{Cancellable, RequestId};

/// Resource-keyed registry of outstanding fetches, capped at `capacity`.
///
/// A key is present exactly while its fetch is outstanding. Adding beyond
/// capacity evicts and cancels the least recently used fetch.
#[derive(Debug)]
pub struct InflightRegistry<R> {
    fetches: Mutex<LruCache<String, R>>,
}

impl<R: Cancellable + Clone> InflightRegistry<R> {
    /// A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { fetches: Mutex::new(LruCache::new(capacity)) }
    }

    /// Install `request` for `key` unless a fetch is already outstanding.
    ///
    /// Returns the outstanding fetch, in which case `request` was not
    /// installed and must not be dispatched. Returns `None` once installed.
    pub fn add(&self, key: &str, request: R) -> Option<R> {
        let evicted = {
            let mut fetches = self.fetches.lock();
            if let Some(existing) = fetches.get(key) {
                return Some(existing.clone());
            }
            fetches.push(key.to_string(), request)
        };

        if let Some((evicted_key, evicted)) = evicted {
            tracing::debug!(key = %evicted_key, id = %evicted.id(), "in-flight capacity reached, canceling oldest fetch");
            evicted.cancel();
        }
        None
    }

    /// Outstanding fetch for `key`, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<R> {
        self.fetches.lock().get(key).cloned()
    }

    /// Outstanding fetch for `key` without touching recency.
    pub fn peek(&self, key: &str) -> Option<R> {
        self.fetches.lock().peek(key).cloned()
    }

    /// Remove `key` if it still maps to the fetch `id`.
    pub fn remove(&self, key: &str, id: RequestId) -> bool {
        let mut fetches = self.fetches.lock();
        if fetches.peek(key).is_some_and(|request| request.id() == id) {
            fetches.pop(key);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fetches.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.fetches.lock().cap().get()
    }

    /// Cancel every outstanding fetch and forget them.
    pub fn evict_all(&self) -> usize {
        let drained: Vec<R> = {
            let mut fetches = self.fetches.lock();
            let mut drained = Vec::with_capacity(fetches.len());
            while let Some((_, request)) = fetches.pop_lru() {
                drained.push(request);
            }
            drained
        };
        for request in &drained {
            request.cancel();
        }
        drained.len()
    }
}
