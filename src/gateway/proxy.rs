//! Reverse proxy to the upstream LLM API.
//!
//! Requests arrive with their `Authorization` header already rewritten by
//! the auth gate. The proxy replays method, path, query, headers, and body
//! against the upstream base URL and streams the response back without
//! buffering, so token-by-token completions reach the client as they are
//! produced.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, Response, header};
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::{Error, Result};

/// Request headers that must not be replayed against the upstream.
const HOP_BY_HOP: [header::HeaderName; 5] = [
    header::HOST,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
];

/// Streaming reverse proxy with a fixed upstream.
pub struct LlmProxy {
    http: reqwest::Client,
    base_url: String,
    max_body_size: usize,
}

impl LlmProxy {
    /// Build the proxy client. The outbound timeout is explicit here;
    /// completion requests routinely run for minutes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the HTTP client cannot be constructed.
    pub fn new(config: &UpstreamConfig, max_body_size: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Upstream HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_body_size,
        })
    }

    /// Replay `request` against the upstream and stream the answer back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamUnavailable`] when the upstream cannot be
    /// reached or times out.
    pub async fn forward(&self, request: Request) -> Result<Response<Body>> {
        let (parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
        let url = format!("{}{path_and_query}", self.base_url);

        let body = axum::body::to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| Error::Internal(format!("Request body: {e}")))?;

        debug!(method = %parts.method, url = %url, "Forwarding to upstream");

        let upstream = self
            .http
            .request(parts.method, &url)
            .headers(forwardable_headers(&parts.headers))
            .body(body)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(e.to_string()))?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(headers) = response.headers_mut() {
            for (name, value) in upstream.headers() {
                if !HOP_BY_HOP.contains(name) && name != header::CONTENT_LENGTH {
                    headers.insert(name.clone(), value.clone());
                }
            }
            // Tell reverse proxies in front of us not to buffer the stream
            headers.insert("x-accel-buffering", header::HeaderValue::from_static("no"));
        }

        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| Error::Internal(format!("Upstream response: {e}")))
    }
}

/// Copy of `headers` with hop-by-hop entries removed.
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !HOP_BY_HOP.contains(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}
