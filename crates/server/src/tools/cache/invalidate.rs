//! cache_invalidate tool implementation.

use std::sync::Arc;

use lumen_core::{DiskCache, Error};
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{json_result, with_cache};

/// Parameters for the cache_invalidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheInvalidateParams {
    /// The resource key (URL) to invalidate.
    pub key: String,

    /// Also zero the hard TTL, so the stored copy is only used if the origin is unreachable.
    #[serde(default)]
    pub full_expire: bool,
}

/// Output from the cache_invalidate tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheInvalidateOutput {
    pub key: String,
    pub full_expire: bool,
    /// False when nothing was stored for the key.
    pub found: bool,
}

/// Implementation of the cache_invalidate tool.
pub async fn invalidate_impl(cache: &Arc<DiskCache>, params: CacheInvalidateParams) -> Result<CallToolResult, McpError> {
    if params.key.trim().is_empty() {
        return Err(Error::InvalidInput("key must not be empty".to_string()).into());
    }

    let key = params.key.clone();
    let full_expire = params.full_expire;
    let found = with_cache(cache, move |cache| {
        let found = cache.contains(&key)?;
        cache.invalidate(&key, full_expire)?;
        Ok(found)
    })
    .await?;

    json_result(&CacheInvalidateOutput { key: params.key, full_expire, found })
}
