//! Resource URL canonicalization.

use lumen_core::Error;
use url::Url;

/// Parse and normalize a resource URL.
///
/// Only absolute `http`/`https` URLs are accepted: resources are addressed
/// exactly as the consumer gave them, so no scheme is guessed. The parser
/// lowercases the host and drops a default port; the fragment is removed and
/// the query string is kept as-is.
pub fn canonicalize(input: &str) -> Result<Url, Error> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidUrl("empty URL".into()));
    }

    let mut parsed = Url::parse(trimmed).map_err(|e| Error::InvalidUrl(format!("{trimmed}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(Error::InvalidUrl(format!("unsupported scheme: {scheme}"))),
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidUrl(format!("{trimmed}: missing host")));
    }

    parsed.set_fragment(None);
    Ok(parsed)
}
