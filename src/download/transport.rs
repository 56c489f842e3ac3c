//! Bundle transport
//!
//! [`Transport`] is the seam between the poller and the network. The HTTP
//! implementation speaks the usual bundle-service protocol: conditional GET
//! with `If-None-Match`, and `Prefer: wait=<seconds>` for long polling.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::error::NetworkError;

/// Upper bound on buffer space reserved from `Content-Length`
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Resource path relative to the service URL
    pub resource: String,
    /// ETag of the last bundle received, sent as `If-None-Match`
    pub etag: Option<String>,
    /// Server-side wait for long polling
    pub long_poll_timeout: Option<Duration>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum FetchResponse {
    NotModified,
    Ok { body: Bytes, etag: Option<String> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(base_url: &str, headers: &HashMap<String, String>) -> Result<Self, NetworkError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| NetworkError::new(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| NetworkError::new(format!("invalid header value: {}", e)))?;
            map.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| NetworkError::new(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: map,
        })
    }

    fn url(&self, resource: &str) -> String {
        format!("{}/{}", self.base_url, resource.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError> {
        let url = self.url(&request.resource);

        // A long poll may legitimately hold the connection for its whole wait
        let timeout = request.timeout + request.long_poll_timeout.unwrap_or_default();

        let mut builder = self
            .client
            .get(&url)
            .headers(self.headers.clone())
            .timeout(timeout);
        if let Some(ref etag) = request.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(wait) = request.long_poll_timeout {
            builder = builder.header("Prefer", format!("wait={}", wait.as_secs()));
        }

        debug!(url = %url, etag = ?request.etag, "Fetching bundle");

        let response = builder
            .send()
            .await
            .map_err(|e| NetworkError::new(format!("request to {} failed: {}", url, e)))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(FetchResponse::NotModified),
            StatusCode::OK => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let mut body = BytesMut::with_capacity(
                    response.content_length().unwrap_or_default().min(MAX_PREALLOCATION) as usize,
                );
                let mut chunks = response.bytes_stream();
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk
                        .map_err(|e| NetworkError::with_status(200, format!("reading body: {}", e)))?;
                    body.extend_from_slice(&chunk);
                }
                debug!(url = %url, bytes = body.len(), "Bundle body received");
                Ok(FetchResponse::Ok {
                    body: body.freeze(),
                    etag,
                })
            }
            status => Err(NetworkError::with_status(
                status.as_u16(),
                format!("server replied {} for {}", status, url),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let t = HttpTransport::new("http://localhost:8080/svc/", &HashMap::new()).unwrap();
        assert_eq!(t.url("/bundles/b0"), "http://localhost:8080/svc/bundles/b0");
        assert_eq!(t.url("bundles/b0"), "http://localhost:8080/svc/bundles/b0");
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(HttpTransport::new("http://localhost", &headers).is_err());
    }
}
