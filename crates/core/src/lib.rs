//! Core types and storage for lumen.
//!
//! This crate provides:
//! - Binary cache record codec
//! - Journaled, LRU-bounded disk store and the disk cache built on it
//! - Size-aware in-memory LRU cache for decoded images
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod config;
pub mod error;
pub mod store;

pub use cache::{CacheRecord, DiskCache, Freshness, MemoryCache};
pub use config::AppConfig;
pub use error::Error;
pub use store::{DiskLruStore, JournaledStore};
