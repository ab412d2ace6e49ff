//! cache_get tool implementation.
//!
//! Reports the stored record for a resource key, without its payload.

use std::collections::BTreeMap;
use std::sync::Arc;

use lumen_core::{DiskCache, Error, Freshness};
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{json_result, with_cache};

/// Parameters for the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetParams {
    /// The resource key (URL) the record was stored under.
    pub key: String,
}

/// Output from the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetOutput {
    pub key: String,
    pub etag: Option<String>,
    /// Origin `Date`, epoch milliseconds (0 if absent).
    pub server_date: i64,
    /// Origin `Last-Modified`, epoch milliseconds (0 if absent).
    pub last_modified: i64,
    /// Hard expiry, epoch milliseconds.
    pub ttl: i64,
    /// Soft expiry, epoch milliseconds.
    pub soft_ttl: i64,
    pub freshness: Freshness,
    pub payload_len: usize,
    pub response_headers: BTreeMap<String, String>,
}

/// Implementation of the cache_get tool.
pub async fn get_impl(cache: &Arc<DiskCache>, params: CacheGetParams) -> Result<CallToolResult, McpError> {
    if params.key.trim().is_empty() {
        return Err(Error::InvalidInput("key must not be empty".to_string()).into());
    }

    let key = params.key.clone();
    let record = with_cache(cache, move |cache| cache.get(&key))
        .await?
        .ok_or_else(|| Error::CacheMiss(params.key))?;

    let now = chrono::Utc::now().timestamp_millis();
    let output = CacheGetOutput {
        key: record.key.clone(),
        etag: record.etag.clone(),
        server_date: record.server_date,
        last_modified: record.last_modified,
        ttl: record.ttl,
        soft_ttl: record.soft_ttl,
        freshness: record.freshness(now),
        payload_len: record.payload.len(),
        response_headers: record.response_headers.into_iter().collect(),
    };
    json_result(&output)
}
