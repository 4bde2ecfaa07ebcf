//! Upstream forwarding client

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use tracing::debug;

use crate::error::{Result, TracerError};

/// Headers that describe one connection and are never relayed
const HOP_BY_HOP: [HeaderName; 6] = [
    header::HOST,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// Remove connection-scoped headers before relaying
#[must_use]
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = headers.clone();
    for name in &HOP_BY_HOP {
        relayed.remove(name);
    }
    relayed.remove("keep-alive");
    relayed.remove("proxy-connection");
    relayed
}

/// Buffered upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers, verbatim
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Whether the body is declared as JSON
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"))
    }
}

/// HTTP client for the inference server
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    /// Build a client; redirects are relayed to the caller, never followed
    ///
    /// # Errors
    ///
    /// `UpstreamFailure` when the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TracerError::UpstreamFailure(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Send one request upstream and buffer the full response
    ///
    /// # Errors
    ///
    /// `UpstreamTimeout` when the call exceeds the client timeout,
    /// `UpstreamFailure` for any other transport error.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let response = self
            .client
            .request(method, url)
            .headers(strip_hop_by_hop(headers))
            .body(body)
            .send()
            .await
            .map_err(|e| classify(url, &e))?;

        let status = response.status();
        let mut headers = response.headers().clone();
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);
        let body = response.bytes().await.map_err(|e| classify(url, &e))?;
        debug!(%url, status = status.as_u16(), bytes = body.len(), "upstream responded");

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(url: &str, err: &reqwest::Error) -> TracerError {
    if err.is_timeout() {
        TracerError::UpstreamTimeout(format!("{url}: {err}"))
    } else {
        TracerError::UpstreamFailure(format!("{url}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_strip_hop_by_hop_keeps_end_to_end_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy:8081"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let relayed = strip_hop_by_hop(&headers);
        assert!(relayed.get(header::HOST).is_none());
        assert!(relayed.get(header::CONNECTION).is_none());
        assert_eq!(relayed.get(header::AUTHORIZATION), Some(&HeaderValue::from_static("Bearer t")));
        assert_eq!(relayed.get("x-request-id"), Some(&HeaderValue::from_static("abc")));
    }

    #[test]
    fn test_is_json() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let response = UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::new(),
        };
        assert!(response.is_json());

        let plain = UpstreamResponse {
            headers: HeaderMap::new(),
            ..response
        };
        assert!(!plain.is_json());
    }
}
