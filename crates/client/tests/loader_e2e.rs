//! Loader against a local origin: network fetch, disk reuse and revalidation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use lumen_client::{FetchConfig, FetchSource, Fetcher, HttpFetcher, ImageLoader, Load, LoaderOptions};
use lumen_core::{DiskCache, Error, Freshness, MemoryCache};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const BODY: &str = "hello pixels";

struct Origin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    conditional: Arc<AtomicUsize>,
}

impl Origin {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Minimal HTTP/1.1 origin: `/missing` is a 404, a request carrying the
/// current ETag gets a 304, anything else the body with a one hour max-age.
async fn spawn_origin() -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let conditional = Arc::new(AtomicUsize::new(0));

    let (server_hits, server_conditional) = (Arc::clone(&hits), Arc::clone(&conditional));
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let hits = Arc::clone(&server_hits);
            let conditional = Arc::clone(&server_conditional);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_ascii_lowercase();
                hits.fetch_add(1, Ordering::SeqCst);

                let response = if request.starts_with("get /missing") {
                    "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                } else if request.contains("if-none-match: \"v1\"") {
                    conditional.fetch_add(1, Ordering::SeqCst);
                    "HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\nCache-Control: max-age=3600\r\nConnection: close\r\n\r\n"
                        .to_string()
                } else {
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nETag: \"v1\"\r\n\
                         Cache-Control: max-age=3600\r\nConnection: close\r\n\r\n{}",
                        BODY.len(),
                        BODY
                    )
                };
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    Origin { addr, hits, conditional }
}

fn decode_utf8(_key: &str, bytes: &Bytes) -> Result<String, Error> {
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::DecodeFailed(e.to_string()))
}

fn loader(fetcher: Arc<HttpFetcher>, disk: &Arc<DiskCache>) -> ImageLoader<u32, String> {
    let memory = MemoryCache::new(64 * 1024, |_, v: &String| v.len());
    ImageLoader::new(memory, fetcher, decode_utf8, LoaderOptions::default(), Some(Arc::clone(disk))).unwrap()
}

async fn load(loader: &ImageLoader<u32, String>, slot: u32, key: &str) -> Result<String, Error> {
    match loader.load(slot, key) {
        Load::Pending(receiver) => receiver.await,
        Load::Ready(value) => Ok(value),
        Load::Empty => panic!("unexpected empty load"),
    }
}

#[tokio::test]
async fn test_network_then_disk_then_conditional() {
    let origin = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let disk: Arc<DiskCache> = Arc::new(DiskCache::new(dir.path(), 1024 * 1024, 1));
    disk.initialize().unwrap();
    let fetcher = Arc::new(HttpFetcher::new(FetchConfig::default()).unwrap().with_disk_cache(Arc::clone(&disk)));
    let url = origin.url("/a.png");

    // cold: network, then persisted
    let first = loader(Arc::clone(&fetcher), &disk);
    assert_eq!(load(&first, 1, &url).await.unwrap(), BODY);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);
    let stored = disk.get(&url).unwrap().unwrap();
    assert_eq!(stored.key, url);
    assert_eq!(stored.etag.as_deref(), Some("\"v1\""));
    assert_eq!(stored.freshness(chrono::Utc::now().timestamp_millis()), Freshness::Fresh);

    // same loader: memory
    assert!(matches!(first.load(2, &url), Load::Ready(v) if v == BODY));

    // new loader, same disk: fresh disk copy, no request
    let second = loader(Arc::clone(&fetcher), &disk);
    assert_eq!(load(&second, 1, &url).await.unwrap(), BODY);
    assert_eq!(origin.hits.load(Ordering::SeqCst), 1);

    // expired: conditional request answered with 304
    disk.invalidate(&url, true).unwrap();
    let resource = fetcher.fetch(&url).await.unwrap();
    assert_eq!(resource.source, FetchSource::NotModified);
    assert_eq!(&resource.record.payload[..], BODY.as_bytes());
    assert_eq!(origin.conditional.load(Ordering::SeqCst), 1);

    let third = loader(Arc::clone(&fetcher), &disk);
    assert_eq!(load(&third, 1, &url).await.unwrap(), BODY);
    assert_eq!(origin.conditional.load(Ordering::SeqCst), 2);
    let refreshed = disk.get(&url).unwrap().unwrap();
    assert_eq!(refreshed.freshness(chrono::Utc::now().timestamp_millis()), Freshness::Fresh);
}

#[tokio::test]
async fn test_http_error_is_not_persisted() {
    let origin = spawn_origin().await;
    let dir = tempfile::tempdir().unwrap();
    let disk: Arc<DiskCache> = Arc::new(DiskCache::new(dir.path(), 1024 * 1024, 1));
    disk.initialize().unwrap();
    let fetcher = Arc::new(HttpFetcher::new(FetchConfig::default()).unwrap().with_disk_cache(Arc::clone(&disk)));
    let url = origin.url("/missing");

    let loader = loader(fetcher, &disk);
    assert!(matches!(load(&loader, 1, &url).await, Err(Error::HttpError(_))));
    assert!(!disk.contains(&url).unwrap());
    assert_eq!(loader.inflight_len(), 0);
}

#[tokio::test]
async fn test_body_over_limit() {
    let origin = spawn_origin().await;
    let config = FetchConfig { max_bytes: 4, ..Default::default() };
    let fetcher = HttpFetcher::new(config).unwrap();

    let result = fetcher.fetch(&origin.url("/big.png")).await;
    assert!(matches!(result, Err(Error::FetchTooLarge(_))));
}
