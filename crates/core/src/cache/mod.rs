//! Two-tier cache for fetched resources.
//!
//! - [`DiskCache`]: persistent records in a [`JournaledStore`](crate::JournaledStore),
//!   one slot per SHA-256 hashed key, encoded with the [`codec`] format
//! - [`MemoryCache`]: size-bounded LRU of decoded values

pub mod codec;
pub mod disk;
pub mod hash;
pub mod memory;
pub mod record;

pub use crate::Error;

pub use disk::DiskCache;
pub use memory::MemoryCache;
pub use record::{CacheRecord, Freshness, RecordHeader};
