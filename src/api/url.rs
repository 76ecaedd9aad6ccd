//! Builds the absolute FHIR base URL used for `Location` headers and bundle
//! `fullUrl`s, honoring reverse-proxy forwarding headers when present.
//!
//! Grounded on the reference server's `api/url.rs`.

use axum::http::HeaderMap;

pub fn base_url_from_headers(headers: &HeaderMap, configured: &str) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .or_else(|| headers.get("x-forwarded-scheme"))
        .and_then(|v| v.to_str().ok());
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get("host"))
        .and_then(|v| v.to_str().ok());

    match (scheme, host) {
        (Some(scheme), Some(host)) => format!("{}://{}/R4", scheme, host),
        _ => configured.to_string(),
    }
}
