//! Shared HTTP plumbing for the backend clients: TLS enforcement, transient
//! error classification and `Retry-After` parsing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};

/// Build a hardened HTTP client.
///
/// HTTPS-only with TLS 1.3 unless `allow_insecure_http` is set for a local
/// development backend.
pub fn build_client(timeout: Duration, allow_insecure_http: bool) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .user_agent(concat!("depthproof/", env!("CARGO_PKG_VERSION")));

    if !allow_insecure_http {
        builder = builder
            .https_only(true)
            .min_tls_version(reqwest::tls::Version::TLS_1_3);
    }

    builder.build()
}

/// Check if a reqwest error is transient and should be retried.
pub fn is_transient_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Check if an HTTP status code indicates a transient error.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Parse a `Retry-After` header value (delta-seconds or HTTP-date).
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Read and parse the `Retry-After` header of a response.
pub fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()))
}
