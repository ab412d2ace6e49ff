//! The persisted cache record and its freshness rules.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A cached resource: raw payload bytes plus HTTP-derived metadata.
///
/// All timestamps are epoch milliseconds. `ttl` and `soft_ttl` are absolute
/// instants, not durations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheRecord {
    /// Original resource identifier, kept for diagnostics.
    pub key: String,
    pub payload: Bytes,
    pub etag: Option<String>,
    pub server_date: i64,
    pub last_modified: i64,
    /// Hard expiry.
    pub ttl: i64,
    /// Instant after which the record should be revalidated.
    pub soft_ttl: i64,
    pub response_headers: HashMap<String, String>,
}

/// Freshness of a record relative to a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Servable without contacting the network.
    Fresh,
    /// Past its soft TTL but not its TTL: servable while a refresh runs.
    Stale,
    /// Past its TTL.
    Expired,
}

impl CacheRecord {
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self { key: key.into(), payload: payload.into(), ..Default::default() }
    }

    /// True if the record is past its hard expiry.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.ttl < now_ms
    }

    /// True if the record should be refreshed from the origin.
    pub fn refresh_needed(&self, now_ms: i64) -> bool {
        self.soft_ttl < now_ms
    }

    pub fn freshness(&self, now_ms: i64) -> Freshness {
        if self.is_expired(now_ms) {
            Freshness::Expired
        } else if self.refresh_needed(now_ms) {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }
}

/// Decoded record header: everything except the payload bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordHeader {
    pub payload_len: u64,
    pub key: String,
    pub etag: Option<String>,
    pub server_date: i64,
    pub last_modified: i64,
    pub ttl: i64,
    pub soft_ttl: i64,
    pub response_headers: HashMap<String, String>,
}

impl RecordHeader {
    pub fn into_record(self, payload: Bytes) -> CacheRecord {
        CacheRecord {
            key: self.key,
            payload,
            etag: self.etag,
            server_date: self.server_date,
            last_modified: self.last_modified,
            ttl: self.ttl,
            soft_ttl: self.soft_ttl,
            response_headers: self.response_headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freshness_transitions() {
        let record = CacheRecord { soft_ttl: 100, ttl: 200, ..CacheRecord::new("k", "v") };
        assert_eq!(record.freshness(50), Freshness::Fresh);
        assert_eq!(record.freshness(100), Freshness::Fresh);
        assert_eq!(record.freshness(150), Freshness::Stale);
        assert_eq!(record.freshness(201), Freshness::Expired);
    }

    #[test]
    fn test_zeroed_ttls_are_expired() {
        let record = CacheRecord::new("k", "v");
        assert!(record.is_expired(1));
        assert!(record.refresh_needed(1));
    }

    #[test]
    fn test_header_into_record() {
        let header = RecordHeader { payload_len: 3, key: "k".into(), ttl: 9, ..Default::default() };
        let record = header.into_record(Bytes::from_static(b"abc"));
        assert_eq!(record.key, "k");
        assert_eq!(record.ttl, 9);
        assert_eq!(&record.payload[..], b"abc");
    }
}
