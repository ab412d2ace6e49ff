//! HTTP caching headers to cache record metadata.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lumen_core::CacheRecord;
use reqwest::header::{self, HeaderMap};

/// Build a [`CacheRecord`] for `payload` from the response `headers`.
///
/// Freshness, in order of precedence:
/// - `Cache-Control: no-store` expires the record at `now_ms`
/// - `Cache-Control: no-cache` zeroes both TTLs (always revalidate)
/// - `max-age` sets the soft TTL; `stale-while-revalidate` extends the hard
///   TTL past it unless `must-revalidate`/`proxy-revalidate` is present
/// - otherwise `Expires - Date` when both are present; an `Expires` at or
///   before `Date`, or one that does not parse, expires the record at `now_ms`
/// - otherwise `now_ms + default_ttl` for both
///
/// The returned record has an empty key; the caller fills it in.
pub fn parse_cache_headers(headers: &HeaderMap, payload: Bytes, now_ms: i64, default_ttl: Duration) -> CacheRecord {
    let server_date = header_date(headers, header::DATE).unwrap_or(0);
    let expires = headers
        .get(header::EXPIRES)
        .map(|v| v.to_str().ok().and_then(parse_http_date).unwrap_or(0));
    let last_modified = header_date(headers, header::LAST_MODIFIED).unwrap_or(0);
    let etag = header_str(headers, header::ETAG).map(str::to_string);

    let mut no_store = false;
    let mut no_cache = false;
    let mut must_revalidate = false;
    let mut max_age: Option<i64> = None;
    let mut stale_while_revalidate: i64 = 0;

    for value in headers.get_all(header::CACHE_CONTROL).iter().filter_map(|v| v.to_str().ok()) {
        for directive in directives(value) {
            match directive.split_once('=') {
                Some(("max-age", secs)) => max_age = parse_seconds(secs).or(max_age),
                Some(("stale-while-revalidate", secs)) => {
                    stale_while_revalidate = parse_seconds(secs).unwrap_or(stale_while_revalidate);
                }
                _ => match directive.as_str() {
                    "no-store" => no_store = true,
                    "no-cache" => no_cache = true,
                    "must-revalidate" | "proxy-revalidate" => must_revalidate = true,
                    _ => {}
                },
            }
        }
    }

    let (soft_ttl, ttl) = if no_store {
        (now_ms, now_ms)
    } else if no_cache {
        (0, 0)
    } else if let Some(max_age) = max_age {
        let soft_ttl = now_ms.saturating_add(max_age.saturating_mul(1000));
        let ttl = if must_revalidate {
            soft_ttl
        } else {
            soft_ttl.saturating_add(stale_while_revalidate.saturating_mul(1000))
        };
        (soft_ttl, ttl)
    } else if let Some(expires) = expires
        && server_date > 0
    {
        let soft_ttl = now_ms.saturating_add(expires.saturating_sub(server_date).max(0));
        (soft_ttl, soft_ttl)
    } else {
        let fallback = now_ms.saturating_add(i64::try_from(default_ttl.as_millis()).unwrap_or(i64::MAX));
        (fallback, fallback)
    };

    CacheRecord {
        key: String::new(),
        payload,
        etag,
        server_date,
        last_modified,
        ttl,
        soft_ttl,
        response_headers: header_map(headers),
    }
}

/// True when the origin asked for `record` not to be stored (`Cache-Control: no-store`).
pub fn is_no_store(record: &CacheRecord) -> bool {
    record
        .response_headers
        .get(header::CACHE_CONTROL.as_str())
        .is_some_and(|value| directives(value).any(|directive| directive == "no-store"))
}

/// Format epoch milliseconds as an HTTP date (`If-Modified-Since`).
pub fn http_date(epoch_ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms).map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

/// Parse an HTTP date into epoch milliseconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_date(headers: &HeaderMap, name: header::HeaderName) -> Option<i64> {
    header_str(headers, name).and_then(parse_http_date)
}

fn directives(value: &str) -> impl Iterator<Item = String> + '_ {
    value.split(',').map(|d| d.trim().to_ascii_lowercase())
}

fn parse_seconds(value: &str) -> Option<i64> {
    value.trim().trim_matches('"').parse::<i64>().ok().map(|secs| secs.max(0))
}

/// Lowercased header names; repeated headers are joined with ", ".
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}
