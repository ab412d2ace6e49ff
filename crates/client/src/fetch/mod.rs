//! Fetching resource bytes, disk cache first.
//!
//! ### Freshness policy
//! - Fresh disk record (soft TTL ahead): served without touching the network
//! - Stale disk record (soft TTL passed, TTL ahead): served immediately; the
//!   loader revalidates it in the background via [`Fetcher::refresh`]
//! - Expired or missing: conditional network request (`If-None-Match`,
//!   `If-Modified-Since`); a `304` reuses the stored bytes
//! - Network failure with an expired record on disk: the stored bytes are
//!   served as stale rather than failing
//!
//! ### Limits
//! - `http`/`https` only
//! - Max body bytes (configurable), checked on `Content-Length` and on the body
//! - Max redirects: 5

pub mod headers;
pub mod url;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lumen_core::{AppConfig, CacheRecord, DiskCache, Error, Freshness};
use reqwest::{Client, StatusCode, header};

pub use headers::{http_date, is_no_store, parse_cache_headers, parse_http_date};
pub use url::canonicalize;

/// Where a fetched resource came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    /// Full response body from the origin.
    Network,
    /// Origin confirmed the stored copy with `304 Not Modified`.
    NotModified,
    /// Fresh record served from disk.
    DiskFresh,
    /// Stale or expired record served from disk.
    DiskStale,
}

impl FetchSource {
    /// True when the record came from the origin and should be persisted.
    pub fn is_from_origin(self) -> bool {
        matches!(self, FetchSource::Network | FetchSource::NotModified)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub record: CacheRecord,
    pub source: FetchSource,
}

/// Source of resource bytes.
///
/// Implementations report one outcome per call. Cancellation is handled by
/// the caller dropping the future.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<FetchedResource, Error>;

    /// Fetch bypassing any fresh or stale cached copy.
    async fn refresh(&self, key: &str) -> Result<FetchedResource, Error> {
        self.fetch(key).await
    }
}

/// Configuration for the HTTP fetcher.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "lumen/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 10MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,

    /// Freshness when a response has no caching headers (default: 24h)
    pub default_ttl: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "lumen/0.1".to_string(),
            max_bytes: 10 * 1024 * 1024,
            timeout: Duration::from_millis(20_000),
            max_redirects: 5,
            default_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
            timeout: config.timeout(),
            default_ttl: config.default_ttl(),
            ..Default::default()
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// HTTP fetcher that consults a disk cache before the network.
///
/// It only reads the disk cache; persisting fetched records is left to the
/// caller (the image loader does it after a successful decode).
pub struct HttpFetcher {
    http: Client,
    config: FetchConfig,
    disk: Option<Arc<DiskCache>>,
}

impl HttpFetcher {
    /// Create a new fetcher with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::HttpError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config, disk: None })
    }

    pub fn with_disk_cache(mut self, disk: Arc<DiskCache>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Get reference to the configuration.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    async fn cached(&self, key: &str) -> Option<CacheRecord> {
        let disk = Arc::clone(self.disk.as_ref()?);
        let owned_key = key.to_string();
        match tokio::task::spawn_blocking(move || disk.get(&owned_key)).await {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                tracing::debug!(key, error = %e, "disk cache unavailable");
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "disk cache lookup task failed");
                None
            }
        }
    }

    /// Network fetch, falling back to `cached` if the network fails.
    async fn revalidate(&self, key: &str, cached: Option<CacheRecord>) -> Result<FetchedResource, Error> {
        match self.fetch_network(key, cached.as_ref()).await {
            Ok(resource) => Ok(resource),
            Err(e) => match cached {
                Some(record) if !matches!(e, Error::InvalidUrl(_) | Error::FetchTooLarge(_)) => {
                    tracing::warn!(key, error = %e, "network fetch failed, serving stored copy");
                    Ok(FetchedResource { record, source: FetchSource::DiskStale })
                }
                _ => Err(e),
            },
        }
    }

    async fn fetch_network(&self, key: &str, cached: Option<&CacheRecord>) -> Result<FetchedResource, Error> {
        let start = Instant::now();
        let url = canonicalize(key)?;

        let mut request = self.http.get(url.as_str());
        if let Some(record) = cached {
            if let Some(etag) = &record.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
            }
            if record.last_modified > 0
                && let Some(date) = http_date(record.last_modified)
            {
                request = request.header(header::IF_MODIFIED_SINCE, date);
            }
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::FetchTimeout(format!("{url}: {e}"))
            } else {
                Error::HttpError(format!("network error: {}", e))
            }
        })?;

        let status = response.status();
        let now = now_ms();

        if status == StatusCode::NOT_MODIFIED
            && let Some(stored) = cached
        {
            let fresh = parse_cache_headers(response.headers(), stored.payload.clone(), now, self.config.default_ttl);
            let mut response_headers = stored.response_headers.clone();
            response_headers.extend(fresh.response_headers);
            let record = CacheRecord {
                key: key.to_string(),
                etag: fresh.etag.or_else(|| stored.etag.clone()),
                server_date: if fresh.server_date > 0 { fresh.server_date } else { stored.server_date },
                last_modified: if fresh.last_modified > 0 { fresh.last_modified } else { stored.last_modified },
                response_headers,
                ..fresh
            };
            tracing::debug!(key, fetch_ms = start.elapsed().as_millis() as u64, "not modified");
            return Ok(FetchedResource { record, source: FetchSource::NotModified });
        }

        if !status.is_success() {
            return Err(Error::HttpError(format!("status {}", status.as_u16())));
        }

        if let Some(len) = response.content_length()
            && len > self.config.max_bytes as u64
        {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", len, self.config.max_bytes)));
        }

        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::HttpError(format!("failed to read response: {}", e)))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!("{} bytes exceeds {}", bytes.len(), self.config.max_bytes)));
        }

        let fetched_bytes = bytes.len();
        let mut record = parse_cache_headers(&headers, bytes, now, self.config.default_ttl);
        record.key = key.to_string();

        tracing::debug!(
            key,
            bytes = fetched_bytes,
            fetch_ms = start.elapsed().as_millis() as u64,
            "fetched from network"
        );

        Ok(FetchedResource { record, source: FetchSource::Network })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, key: &str) -> Result<FetchedResource, Error> {
        canonicalize(key)?;
        let cached = self.cached(key).await;

        if let Some(record) = &cached {
            match record.freshness(now_ms()) {
                Freshness::Fresh => {
                    tracing::debug!(key, "serving fresh disk copy");
                    return Ok(FetchedResource { record: record.clone(), source: FetchSource::DiskFresh });
                }
                Freshness::Stale => {
                    tracing::debug!(key, "serving stale disk copy");
                    return Ok(FetchedResource { record: record.clone(), source: FetchSource::DiskStale });
                }
                Freshness::Expired => {}
            }
        }

        self.revalidate(key, cached).await
    }

    async fn refresh(&self, key: &str) -> Result<FetchedResource, Error> {
        canonicalize(key)?;
        let cached = self.cached(key).await;
        self.revalidate(key, cached).await
    }
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("config", &self.config)
            .field("disk", &self.disk.as_ref().map(|disk| disk.directory().to_path_buf()))
            .finish()
    }
}
