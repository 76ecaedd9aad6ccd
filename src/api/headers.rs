//! FHIR HTTP header parsing: the small subset this server's interactions
//! actually use (`ETag`/`If-Match` for optimistic concurrency, `If-None-Exist`
//! for conditional create).
//!
//! Grounded on the reference server's `api/headers.rs`, trimmed to what
//! `SPEC_FULL.md` §6 requires — content negotiation and `Prefer` handling
//! stay out of scope.

use axum::http::HeaderMap;

/// Parses a weak ETag (`W/"3141"`) into its version id.
pub fn parse_etag(etag: &str) -> Option<i32> {
    etag.trim_start_matches("W/\"").trim_end_matches('"').parse().ok()
}

pub fn format_etag(version: i32) -> String {
    format!("W/\"{}\"", version)
}

pub fn extract_if_match(headers: &HeaderMap) -> Option<i32> {
    headers.get("if-match").and_then(|v| v.to_str().ok()).and_then(parse_etag)
}

pub fn extract_if_none_exist(headers: &HeaderMap) -> Option<String> {
    headers.get("if-none-exist").and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_etag() {
        assert_eq!(parse_etag(&format_etag(42)), Some(42));
    }
}
