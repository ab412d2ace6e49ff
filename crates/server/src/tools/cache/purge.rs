//! cache_purge tool implementation.
//!
//! Removes a single entry by key, or clears the whole cache.

use std::sync::Arc;

use lumen_core::{DiskCache, Error};
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{json_result, with_cache};

/// Parameters for the cache_purge tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeParams {
    /// Remove the entry stored under this resource key.
    pub key: Option<String>,

    /// Remove every entry.
    #[serde(default)]
    pub all: bool,
}

/// Output from the cache_purge tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeOutput {
    /// Bytes stored before the purge.
    pub bytes_before: u64,
    /// Bytes stored after the purge.
    pub bytes_after: u64,
}

/// Implementation of the cache_purge tool.
pub async fn purge_impl(cache: &Arc<DiskCache>, params: CachePurgeParams) -> Result<CallToolResult, McpError> {
    let key = params.key.filter(|key| !key.trim().is_empty());
    if key.is_none() && !params.all {
        return Err(Error::InvalidInput("Either key or all=true must be specified".to_string()).into());
    }

    let all = params.all;
    let (bytes_before, bytes_after) = with_cache(cache, move |cache| {
        let before = cache.size()?;
        if all {
            cache.clear()?;
        } else if let Some(key) = &key {
            cache.remove(key)?;
        }
        Ok((before, cache.size()?))
    })
    .await?;

    json_result(&CachePurgeOutput { bytes_before, bytes_after })
}
