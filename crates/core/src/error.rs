//! Unified error types for lumen.
//!
//! Cache-layer failures (I/O, corruption) are recovered inside the disk cache
//! and never reach consumers; the remaining variants describe fetch and
//! programming errors that callers do see.

use std::sync::Arc;

use rmcp::model::{ErrorCode, ErrorData as McpError};

/// Unified error type shared by the cache, the loader and the server.
///
/// `Clone` so a single fetch outcome can be delivered to every coalesced waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Operation attempted on a disk cache that was never opened or is closed.
    #[error("NOT_INITIALIZED: disk cache is not initialized or already closed")]
    NotInitialized,

    /// Magic mismatch, truncated stream or length mismatch in a stored record.
    #[error("CORRUPT_RECORD: {0}")]
    CorruptRecord(String),

    /// Filesystem failure (directory creation, store open, read/write).
    #[error("IO_ERROR: {0}")]
    Io(Arc<std::io::Error>),

    /// Invalid input parameters.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// No cache entry found for the given key.
    #[error("CACHE_MISS: {0}")]
    CacheMiss(String),

    /// Invalid or unsupported resource URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// HTTP error response or transport failure.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),

    /// Fetch timeout.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// The external decoder rejected the payload.
    #[error("DECODE_FAILED: {0}")]
    DecodeFailed(String),

    /// The request was canceled before it completed.
    #[error("CANCELED")]
    Canceled,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Io(Arc::new(err.into()))
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let (code, message) = match &err {
            Error::InvalidInput(msg) => (-32602, msg.clone()),
            Error::CacheMiss(msg) => (-32001, msg.clone()),
            Error::InvalidUrl(msg) => (-32003, msg.clone()),
            Error::FetchTimeout(msg) => (-32006, msg.clone()),
            Error::FetchTooLarge(msg) => (-32007, msg.clone()),
            Error::HttpError(msg) => (-32008, msg.clone()),
            Error::DecodeFailed(msg) => (-32013, msg.clone()),
            Error::Canceled => (-32014, "Request canceled".to_string()),
            Error::NotInitialized => (-32020, "Disk cache is not initialized".to_string()),
            Error::CorruptRecord(msg) => (-32021, msg.clone()),
            Error::Io(e) => (-32022, e.to_string()),
        };

        McpError { code: ErrorCode(code), message: message.into(), data: None }
    }
}
