//! Authenticated Graph calls

use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::GraphSession;
use crate::transport::TransportResponse;
use crate::{Error, Result};

/// Correlation id the authority uses for request tracing
pub const CLIENT_REQUEST_ID: &str = "client-request-id";
/// Ask Graph to echo the correlation id back
pub const RETURN_CLIENT_REQUEST_ID: &str = "return-client-request-id";

const JSON: &str = "application/json";

impl GraphSession {
    /// Expand a relative Graph path (`me`, `/me/messages`) to a full URL.
    /// Absolute http(s) URLs are returned unchanged.
    pub fn api_endpoint(&self, url: &str) -> Result<String> {
        if let Ok(parsed) = Url::parse(url) {
            if matches!(parsed.scheme(), "http" | "https") {
                return Ok(url.to_string());
            }
        }

        let base = format!("{}{}/", self.config.resource, self.config.api_version);
        let base = Url::parse(&base).map_err(|e| Error::Config(format!("Invalid resource: {e}")))?;
        let joined = base
            .join(url.trim_start_matches('/'))
            .map_err(|e| Error::Internal(format!("Invalid Graph endpoint '{url}': {e}")))?;
        Ok(joined.into())
    }

    /// Default headers for a Graph call, with `extra` overriding on collision.
    ///
    /// Each call gets a fresh `client-request-id`.
    pub fn headers(&self, extra: Option<HeaderMap>) -> Result<HeaderMap> {
        let token = self
            .state
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(Error::NotAuthenticated)?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value(&self.config.user_agent)?);
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
        headers.insert(ACCEPT, HeaderValue::from_static(JSON));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON));
        headers.insert(CLIENT_REQUEST_ID, header_value(&Uuid::new_v4().to_string())?);
        headers.insert(RETURN_CLIENT_REQUEST_ID, HeaderValue::from_static("true"));

        if let Some(extra) = extra {
            // `extend` replaces every value of a colliding key
            headers.extend(extra);
        }
        Ok(headers)
    }

    /// Send an authenticated Graph request, refreshing the token first if it
    /// is about to expire.
    pub async fn api_request(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<TransportResponse> {
        self.ensure_valid(self.config.refresh_threshold_secs).await?;

        let endpoint = self.api_endpoint(url)?;
        let headers = self.headers(extra_headers)?;
        debug!(method = %method, endpoint = %endpoint, "Graph request");

        self.transport
            .send_json(method, &endpoint, headers, body)
            .await
    }

    /// GET a Graph resource
    pub async fn get(&mut self, url: &str) -> Result<TransportResponse> {
        self.api_request(Method::GET, url, None, None).await
    }

    /// POST a JSON body
    pub async fn post(&mut self, url: &str, body: &Value) -> Result<TransportResponse> {
        self.api_request(Method::POST, url, Some(body), None).await
    }

    /// PATCH a JSON body
    pub async fn patch(&mut self, url: &str, body: &Value) -> Result<TransportResponse> {
        self.api_request(Method::PATCH, url, Some(body), None).await
    }

    /// DELETE a Graph resource
    pub async fn delete(&mut self, url: &str) -> Result<TransportResponse> {
        self.api_request(Method::DELETE, url, None, None).await
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Internal(format!("Invalid header value: {e}")))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::test_support::{config, harness};
    use super::*;

    async fn logged_in() -> super::super::test_support::Harness {
        let mut h = harness(config(&["User.Read"])).await;
        h.session
            .save(&json!({"access_token": "at", "refresh_token": "rt", "expires_in": 3600, "scope": "User.Read"}))
            .unwrap();
        h
    }

    #[tokio::test]
    async fn relative_endpoints_join_resource_and_version() {
        let h = harness(config(&[])).await;
        assert_eq!(
            h.session.api_endpoint("me").unwrap(),
            "https://graph.microsoft.com/v1.0/me"
        );
        assert_eq!(
            h.session.api_endpoint("/me/messages?$top=5").unwrap(),
            "https://graph.microsoft.com/v1.0/me/messages?$top=5"
        );
    }

    #[tokio::test]
    async fn beta_version_is_used() {
        let mut cfg = config(&[]);
        cfg.api_version = "beta".to_string();
        let h = harness(cfg).await;
        assert_eq!(
            h.session.api_endpoint("me").unwrap(),
            "https://graph.microsoft.com/beta/me"
        );
    }

    #[tokio::test]
    async fn absolute_endpoints_pass_through() {
        let h = harness(config(&[])).await;
        let next = "https://graph.microsoft.com/v1.0/me/messages?$skip=10";
        assert_eq!(h.session.api_endpoint(next).unwrap(), next);
    }

    #[tokio::test]
    async fn headers_carry_token_and_fresh_request_id() {
        let h = logged_in().await;

        let first = h.session.headers(None).unwrap();
        let second = h.session.headers(None).unwrap();

        assert_eq!(first[AUTHORIZATION], "Bearer at");
        assert_eq!(first[ACCEPT], "application/json");
        assert_eq!(first[CONTENT_TYPE], "application/json");
        assert_eq!(first[RETURN_CLIENT_REQUEST_ID], "true");
        assert_ne!(first[CLIENT_REQUEST_ID], second[CLIENT_REQUEST_ID]);
    }

    #[tokio::test]
    async fn caller_headers_override_defaults() {
        let h = logged_in().await;
        let mut extra = HeaderMap::new();
        extra.insert(ACCEPT, HeaderValue::from_static("text/plain"));
        extra.insert("prefer", HeaderValue::from_static("outlook.body-content-type=\"text\""));

        let headers = h.session.headers(Some(extra)).unwrap();

        assert_eq!(headers.get_all(ACCEPT).iter().count(), 1);
        assert_eq!(headers[ACCEPT], "text/plain");
        assert!(headers.contains_key("prefer"));
        assert_eq!(headers[AUTHORIZATION], "Bearer at");
    }

    #[tokio::test]
    async fn headers_require_token() {
        let h = harness(config(&[])).await;
        assert!(matches!(h.session.headers(None), Err(Error::NotAuthenticated)));
    }

    #[tokio::test]
    async fn get_sends_authenticated_request() {
        let mut h = logged_in().await;
        h.transport.push(200, json!({"displayName": "Megan"}));

        let response = h.session.get("me").await.unwrap();

        assert_eq!(response.body["displayName"], "Megan");
        let sent = h.transport.sent.lock()[0].clone();
        assert_eq!(sent.method, Method::GET);
        assert_eq!(sent.url, "https://graph.microsoft.com/v1.0/me");
        assert_eq!(sent.headers[AUTHORIZATION], "Bearer at");
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_before_call() {
        let mut h = harness(config(&["User.Read"])).await;
        h.session
            .save(&json!({"access_token": "old", "refresh_token": "rt", "expires_in": 1, "scope": "User.Read"}))
            .unwrap();
        h.transport.push(
            200,
            json!({"access_token": "new", "refresh_token": "rt2", "expires_in": 3600, "scope": "User.Read"}),
        );
        h.transport.push(204, Value::Null);

        let response = h.session.delete("me/events/1").await.unwrap();

        assert_eq!(response.status, 204);
        let sent = h.transport.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].method, Method::DELETE);
        assert_eq!(sent[1].headers[AUTHORIZATION], "Bearer new");
    }
}
