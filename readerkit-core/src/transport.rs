//! POST-only JSON channel to the reader backend.
//!
//! [`HttpTransport`] wraps an HTTP client with sensible defaults (timeouts,
//! user-agent, HTTPS enforcement) and retry middleware for transient
//! failures. HTTP responses of any status are returned to the caller — status
//! interpretation (including the protocol-significant 404 on `certifyKeys`)
//! belongs to the pool manager, not the channel.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use serde_json::Value;
use thiserror::Error;

/// Transport-level failures: the request never produced an HTTP response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network_error: {url}: {error}")]
    Network { url: String, error: String },
    #[error("invalid response body from {url}: {error}")]
    InvalidBody { url: String, error: String },
}

/// An HTTP response: status code plus parsed JSON body.
///
/// Non-JSON bodies (the server's human-readable error texts) surface as a
/// JSON string; empty bodies as `null`.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

impl TransportResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request/response channel speaking the backend's POST-only JSON protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs `body` to `<baseUrl>/<method>` and returns the response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] only when no HTTP response was obtained
    /// (connectivity, timeout, retries exhausted on transient statuses).
    async fn post(&self, method: &str, body: Value) -> Result<TransportResponse, TransportError>;
}

/// HTTP transport with retry middleware for transient failures.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    max_retries: usize,
}

impl HttpTransport {
    /// Creates a transport for `base_url` (no trailing slash needed).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        #[cfg(not(test))]
        assert!(
            base_url.starts_with("https://")
                || base_url.starts_with("http://127.0.0.1")
                || base_url.starts_with("http://localhost"),
            "reader backend URL must be HTTPS (or loopback)"
        );
        Self {
            base_url,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3, // total attempts = 4
        }
    }

    /// Overrides the per-request deadline (default five seconds).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the transient-failure retry budget (default three retries).
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), method)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, method: &str, body: Value) -> Result<TransportResponse, TransportError> {
        let url = self.url(method);
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries);

        let response = (|| async {
            execute(
                self.client
                    .post(&url)
                    .timeout(self.timeout)
                    .header(
                        "User-Agent",
                        format!("readerkit-core/{}", env!("CARGO_PKG_VERSION")),
                    )
                    .json(&body),
                &url,
            )
            .await
        })
        .retry(backoff)
        .when(PostError::is_retryable)
        .await
        .map_err(|err| TransportError::Network {
            url: url.clone(),
            error: err.error,
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|err| TransportError::Network {
            url: url.clone(),
            error: format!("failed to read response body: {err}"),
        })?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(TransportResponse { status, body })
    }
}

#[derive(Debug)]
struct PostError {
    error: String,
    retryable: bool,
}

impl PostError {
    fn retryable(error: String) -> Self {
        Self {
            error,
            retryable: true,
        }
    }

    fn permanent(error: String) -> Self {
        Self {
            error,
            retryable: false,
        }
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

async fn execute(
    request_builder: reqwest::RequestBuilder,
    url: &str,
) -> Result<reqwest::Response, PostError> {
    match request_builder.send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            if status == 429 || (500..600).contains(&status) {
                return Err(PostError::retryable(format!(
                    "{url} answered transient status {status}"
                )));
            }
            Ok(response)
        }
        Err(err) if err.is_timeout() || err.is_connect() => Err(PostError::retryable(format!(
            "request timeout/connect error: {err}"
        ))),
        Err(err) => Err(PostError::permanent(format!("request failed: {err}"))),
    }
}
