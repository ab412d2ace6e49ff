//! lumen-cache server entry point.
//!
//! Boots an MCP server on stdio transport that administers the configured
//! disk cache. Logging goes to stderr to avoid interfering with the JSON-RPC
//! protocol on stdout.

use std::sync::Arc;

use anyhow::Result;
use lumen_core::{AppConfig, DiskCache};
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use tracing_subscriber::EnvFilter;

mod handler;
mod tools;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    let cache = Arc::new(DiskCache::from_config(&config));
    cache.initialize()?;

    tracing::info!(
        cache_dir = %config.cache_dir.display(),
        app_version = config.app_version,
        max_disk_bytes = config.max_disk_bytes,
        "Starting lumen-cache server on stdio transport"
    );

    let handler = handler::LumenCacheServer::new(Arc::clone(&cache));
    let server = serve_server(handler, stdio()).await?;
    let quit = server.waiting().await;

    cache.close()?;
    tracing::info!("disk cache closed");

    quit?;
    Ok(())
}
