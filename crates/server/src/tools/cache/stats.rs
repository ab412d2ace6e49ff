//! cache_stats tool implementation.

use std::sync::Arc;

use lumen_core::DiskCache;
use rmcp::{ErrorData as McpError, model::CallToolResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{json_result, with_cache};

/// Output from the cache_stats tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheStatsOutput {
    /// Cache directory on disk.
    pub directory: String,
    /// Application version stamped into the store journal.
    pub app_version: u32,
    /// Bytes currently stored.
    pub bytes_used: u64,
    /// Byte budget; least recently used entries are evicted beyond it.
    pub max_bytes: u64,
}

/// Implementation of the cache_stats tool.
pub async fn stats_impl(cache: &Arc<DiskCache>) -> Result<CallToolResult, McpError> {
    let bytes_used = with_cache(cache, DiskCache::size).await?;

    let output = CacheStatsOutput {
        directory: cache.directory().display().to_string(),
        app_version: cache.app_version(),
        bytes_used,
        max_bytes: cache.max_bytes(),
    };
    json_result(&output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::cache::test_support::{open_cache, parse, seed};

    #[tokio::test]
    async fn test_stats_reports_usage() {
        let (_dir, cache) = open_cache();
        let empty: CacheStatsOutput = parse(&stats_impl(&cache).await.unwrap());
        assert_eq!(empty.bytes_used, 0);
        assert_eq!(empty.max_bytes, 1024 * 1024);
        assert_eq!(empty.app_version, 1);

        seed(&cache, "https://example.com/a.png", "pixels");
        let used: CacheStatsOutput = parse(&stats_impl(&cache).await.unwrap());
        assert!(used.bytes_used > 0);
    }

    #[tokio::test]
    async fn test_stats_on_closed_cache() {
        let (_dir, cache) = open_cache();
        cache.close().unwrap();
        assert!(stats_impl(&cache).await.is_err());
    }
}
