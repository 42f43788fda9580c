//! Outbound HTTP transport
//!
//! The session only needs two shapes of request: form POSTs to the token
//! endpoint and JSON calls to Graph. Both return the status and parsed body;
//! interpreting the body is the caller's job.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::{Error, Result};

/// Status and JSON body of an outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Parsed JSON body (`Value::Null` if empty or not JSON)
    pub body: Value,
}

impl TransportResponse {
    /// Create a response
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// 2xx status
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outbound HTTP used for token exchanges and Graph calls.
///
/// Implementations must not retry; retry policy belongs to the host.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
    /// POST an `application/x-www-form-urlencoded` body
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<TransportResponse>;

    /// Send a request with an optional JSON body
    async fn send_json(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&Value>,
    ) -> Result<TransportResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a client from session settings (timeout, TLS verification)
    pub fn new(config: &SessionConfig) -> Result<Self> {
        if config.danger_accept_invalid_certs {
            warn!("TLS certificate verification is DISABLED for outbound calls");
        }

        let client = Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
            .build()?;

        Ok(Self { client })
    }

    /// Wrap an existing client
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn finish(response: reqwest::Response) -> Result<TransportResponse> {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read response body: {e}")))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|e| {
                debug!(status, error = %e, "Response body is not JSON");
                Value::Null
            })
        };
        Ok(TransportResponse { status, body })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<TransportResponse> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("POST {url} failed: {e}")))?;

        Self::finish(response).await
    }

    async fn send_json(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<&Value>,
    ) -> Result<TransportResponse> {
        let mut request = self.client.request(method.clone(), url).headers(headers);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{method} {url} failed: {e}")))?;

        Self::finish(response).await
    }
}
