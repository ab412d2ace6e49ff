//! Cache administration MCP tools.
//!
//! The disk cache is synchronous; every tool runs its cache work on the
//! blocking pool.

pub mod get;
pub mod invalidate;
pub mod purge;
pub mod stats;

use std::sync::Arc;

use lumen_core::{DiskCache, Error};
use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

pub use get::{CacheGetOutput, CacheGetParams, get_impl};
pub use invalidate::{CacheInvalidateOutput, CacheInvalidateParams, invalidate_impl};
pub use purge::{CachePurgeOutput, CachePurgeParams, purge_impl};
pub use stats::{CacheStatsOutput, stats_impl};

async fn with_cache<T, F>(cache: &Arc<DiskCache>, op: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&DiskCache) -> Result<T, Error> + Send + 'static,
{
    let cache = Arc::clone(cache);
    tokio::task::spawn_blocking(move || op(&cache))
        .await
        .map_err(|e| Error::from(std::io::Error::other(e)))?
}

fn json_result<T: Serialize>(output: &T) -> Result<CallToolResult, McpError> {
    let json =
        serde_json::to_string_pretty(output).map_err(|e| Error::InvalidInput(format!("Failed to serialize output: {e}")))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}
