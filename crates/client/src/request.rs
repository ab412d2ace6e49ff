//! Request identity and cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

/// Process-unique request identifier, allocated in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request that can be canceled.
///
/// Cancellation is a non-blocking, idempotent signal. It does not wait for the
/// work to stop; it only guarantees the eventual completion is discarded.
pub trait Cancellable {
    fn id(&self) -> RequestId;

    fn cancel(&self);

    fn is_canceled(&self) -> bool;
}

/// One-way cancellation flag that async work can wait on.
#[derive(Debug, Default)]
pub struct CancelFlag {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns true only for the call that raised it.
    pub fn cancel(&self) -> bool {
        let first = !self.canceled.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_one();
        }
        first
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Resolves once the flag is raised. Intended for a single waiter.
    pub async fn canceled(&self) {
        if self.is_canceled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Minimal cancellable request for registry and pacer tests.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct TestRequest {
    id: RequestId,
    flag: std::sync::Arc<CancelFlag>,
}

#[cfg(test)]
impl TestRequest {
    pub(crate) fn new() -> Self {
        Self { id: RequestId::next(), flag: std::sync::Arc::new(CancelFlag::new()) }
    }
}

#[cfg(test)]
impl Cancellable for TestRequest {
    fn id(&self) -> RequestId {
        self.id
    }

    fn cancel(&self) {
        self.flag.cancel();
    }

    fn is_canceled(&self) -> bool {
        self.flag.is_canceled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_request_ids_increase() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert!(b > a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let flag = CancelFlag::new();
        assert!(!flag.is_canceled());
        assert!(flag.cancel());
        assert!(!flag.cancel());
        assert!(flag.is_canceled());
    }

    #[tokio::test]
    async fn test_canceled_wakes_waiter() {
        let flag = Arc::new(CancelFlag::new());
        let waiter = {
            let flag = Arc::clone(&flag);
            tokio::spawn(async move { flag.canceled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_wait_resolves_immediately() {
        let flag = CancelFlag::new();
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), flag.canceled()).await.unwrap();
    }
}
