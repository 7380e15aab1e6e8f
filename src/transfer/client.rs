//! HTTP client wrapper used by the transfer engine.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response};
use tracing::debug;
use url::Url;

use super::TransferError;
use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use crate::redact::redact_link;
use crate::user_agent;

/// HTTP client for payload transfers.
///
/// Create once and clone freely; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default connect and read timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ClientBuild`] if the TLS backend cannot be
    /// initialised.
    pub fn new() -> Result<Self, TransferError> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeouts.
    ///
    /// `read_timeout` bounds the idle time between body reads, not the total
    /// transfer time, so large books on slow mirrors still complete.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::ClientBuild`] if the client cannot be built.
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, TransferError> {
        let client = build_client(
            connect_timeout,
            read_timeout,
            &user_agent::default_transfer_user_agent(),
        )
        .map_err(|source| TransferError::ClientBuild { source })?;
        Ok(Self { client })
    }

    /// Wraps an already configured reqwest client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Sends a GET and maps failures to [`TransferError`].
    ///
    /// # Errors
    ///
    /// - [`TransferError::InvalidUrl`] if `url` is not absolute
    /// - [`TransferError::Timeout`] / [`TransferError::Network`] if no response arrives
    /// - [`TransferError::HttpStatus`] for any non-2xx status
    pub async fn get(&self, url: &str) -> Result<Response, TransferError> {
        let shown = redact_link(url);
        Url::parse(url).map_err(|_| TransferError::invalid_url(shown.clone()))?;

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(shown.clone())
            } else {
                TransferError::network(shown.clone(), e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            debug!(status = status.as_u16(), url = %shown, "non-success response");
            return Err(TransferError::http_status_with_retry_after(
                shown,
                status.as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }

    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Lowercased media type of a response, without parameters.
#[must_use]
pub fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

pub(crate) fn build_client(
    connect_timeout: Duration,
    read_timeout: Duration,
    user_agent: &str,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .gzip(true)
        .user_agent(user_agent)
        .build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_with_defaults() {
        assert!(HttpClient::new().is_ok());
    }

    #[tokio::test]
    async fn test_get_rejects_relative_url() {
        let client = HttpClient::new().unwrap();
        let err = client.get("/books/a.epub").await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_invalid_url_error_is_redacted() {
        let client = HttpClient::new().unwrap();
        let err = client.get("no-scheme?key=hunter2").await.unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }
}
