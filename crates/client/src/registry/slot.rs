use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::request::{Cancellable, RequestId};

/// Consumer-keyed registry: the most recent request for a slot wins.
#[derive(Debug)]
pub struct SlotRegistry<S, R> {
    requests: Mutex<HashMap<S, R>>,
}

impl<S, R> Default for SlotRegistry<S, R> {
    fn default() -> Self {
        Self { requests: Mutex::new(HashMap::new()) }
    }
}

impl<S: Eq + Hash, R: Cancellable + Clone> SlotRegistry<S, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `request` for `slot`, canceling and returning the request it replaces.
    pub fn put(&self, slot: S, request: R) -> Option<R> {
        let previous = self.requests.lock().insert(slot, request);
        if let Some(previous) = &previous {
            previous.cancel();
        }
        previous
    }

    pub fn get(&self, slot: &S) -> Option<R> {
        self.requests.lock().get(slot).cloned()
    }

    /// Stop tracking `slot`. The request is returned as-is, not canceled.
    pub fn remove(&self, slot: &S) -> Option<R> {
        self.requests.lock().remove(slot)
    }

    /// Stop tracking `slot` only if it still holds the request `id`.
    ///
    /// Completions use this so a late finisher never drops a newer request.
    pub fn remove_if(&self, slot: &S, id: RequestId) -> bool {
        let mut requests = self.requests.lock();
        if requests.get(slot).is_some_and(|request| request.id() == id) {
            requests.remove(slot);
            true
        } else {
            false
        }
    }

    /// Cancel every tracked request and forget them.
    pub fn evict_all(&self) -> usize {
        let drained: Vec<R> = self.requests.lock().drain().map(|(_, request)| request).collect();
        for request in &drained {
            request.cancel();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TestRequest;

    #[test]
    fn test_put_replaces_and_cancels() {
        let registry = SlotRegistry::new();
        let a = TestRequest::new();
        let b = TestRequest::new();

        assert!(registry.put("row-1", a.clone()).is_none());
        let replaced = registry.put("row-1", b.clone()).unwrap();

        assert_eq!(replaced.id(), a.id());
        assert!(a.is_canceled());
        assert!(!b.is_canceled());
        assert_eq!(registry.get(&"row-1").unwrap().id(), b.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_slots_are_independent() {
        let registry = SlotRegistry::new();
        let a = TestRequest::new();
        let b = TestRequest::new();
        registry.put(1, a.clone());
        registry.put(2, b.clone());

        assert!(!a.is_canceled() && !b.is_canceled());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_if_checks_identity() {
        let registry = SlotRegistry::new();
        let old = TestRequest::new();
        let new = TestRequest::new();
        registry.put("row", old.clone());
        registry.put("row", new.clone());

        assert!(!registry.remove_if(&"row", old.id()));
        assert_eq!(registry.get(&"row").unwrap().id(), new.id());
        assert!(registry.remove_if(&"row", new.id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_does_not_cancel() {
        let registry = SlotRegistry::new();
        let a = TestRequest::new();
        registry.put("row", a.clone());

        assert!(registry.remove(&"row").is_some());
        assert!(!a.is_canceled());
        assert!(registry.remove(&"row").is_none());
    }

    #[test]
    fn test_evict_all_cancels_everything() {
        let registry = SlotRegistry::new();
        let requests: Vec<_> = (0..3).map(|_| TestRequest::new()).collect();
        for (slot, request) in requests.iter().enumerate() {
            registry.put(slot, request.clone());
        }

        assert_eq!(registry.evict_all(), 3);
        assert!(requests.iter().all(TestRequest::is_canceled));
        assert!(registry.is_empty());
    }
}
