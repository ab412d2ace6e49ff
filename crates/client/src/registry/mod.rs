//! Registries of outstanding requests.
//!
//! - [`SlotRegistry`]: at most one request per consumer slot; the newest wins
//! - [`InflightRegistry`]: at most one fetch per resource, bounded by an LRU
//!   whose evictions cancel the evicted fetch
//!
//! Both hold their lock only for the map mutation. Cancellation of a
//! superseded or evicted request happens after the lock is released.

mod inflight;
mod slot;

pub use inflight::InflightRegistry;
pub use slot::SlotRegistry;
