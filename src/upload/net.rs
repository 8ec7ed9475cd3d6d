//! # Net Client
//!
//! One POST of a JSON body to the cloud endpoint. The upload worker only
//! sees a status code and body, or a transport failure.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header carrying the upload credential
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Whole-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Redirects followed at most
pub const MAX_REDIRECTS: usize = 1;

/// Transport-level failure: no status code is available
#[derive(Debug, Error)]
pub enum NetError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("client setup failed: {0}")]
    Setup(String),
}

/// Completed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetResponse {
    pub status: u16,
    pub body: String,
}

impl NetResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Status in `[200, 300)`
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Posts JSON bodies to an endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetClient: Send + Sync {
    /// Sends `body` to `url`, authenticating with `credential`.
    async fn post_json(&self, url: &str, body: &str, credential: &str) -> Result<NetResponse, NetError>;
}

/// HTTPS client backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpNetClient {
    client: reqwest::Client,
}

impl HttpNetClient {
    /// Builds a client with the gateway's timeout and redirect policy.
    ///
    /// # Errors
    ///
    /// Returns `NetError::Setup` if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, NetError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| NetError::Setup(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl NetClient for HttpNetClient {
    async fn post_json(&self, url: &str, body: &str, credential: &str) -> Result<NetResponse, NetError> {
        let url = normalize_url(url);
        debug!("POST {} ({} bytes)", url, body.len());

        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "*/*")
            .header(reqwest::header::CONNECTION, "close")
            .body(body.to_string());
        if !credential.is_empty() {
            request = request.header(API_KEY_HEADER, credential);
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok(NetResponse { status, body })
    }
}

/// Appends a trailing `/` to https URLs without a path terminator or query.
///
/// Hosted endpoints commonly answer the bare path with a 308 to the
/// slash-terminated one.
pub fn normalize_url(url: &str) -> String {
    if url.starts_with("https://") && !url.ends_with('/') && !url.contains('?') {
        format!("{}/", url)
    } else {
        url.to_string()
    }
}

fn classify(e: reqwest::Error) -> NetError {
    if e.is_timeout() {
        NetError::Timeout
    } else {
        NetError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(API_KEY_HEADER, "X-API-Key");
        assert_eq!(REQUEST_TIMEOUT, Duration::from_secs(8));
        assert_eq!(MAX_REDIRECTS, 1);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("https://api.example.com/logs"), "https://api.example.com/logs/");
        assert_eq!(normalize_url("https://api.example.com/logs/"), "https://api.example.com/logs/");
        assert_eq!(normalize_url("https://api.example.com/logs?v=2"), "https://api.example.com/logs?v=2");
        assert_eq!(normalize_url("http://10.0.0.5/logs"), "http://10.0.0.5/logs");
    }

    #[test]
    fn test_success_range() {
        assert!(NetResponse::new(200, "").is_success());
        assert!(NetResponse::new(299, "").is_success());
        assert!(!NetResponse::new(300, "").is_success());
        assert!(!NetResponse::new(199, "").is_success());
        assert!(!NetResponse::new(401, "denied").is_success());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let client = HttpNetClient::new().unwrap();
        // Port 9 (discard) is not listening on loopback in test environments
        let result = client.post_json("http://127.0.0.1:9/logs", "{}", "S1").await;
        assert!(matches!(result, Err(NetError::Transport(_)) | Err(NetError::Timeout)));
    }
}
