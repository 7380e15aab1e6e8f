//! Page retrieval for resolvers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use super::ResolveError;
use crate::cancel::CancellationToken;
use crate::redact::redact_link;
use crate::transfer::build_client;
use crate::user_agent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of tries for a page fetch.
pub const DEFAULT_PAGE_FETCH_MAX_RETRIES: u32 = 3;

/// Default linear backoff step between page fetch tries.
pub const DEFAULT_PAGE_FETCH_BACKOFF: Duration = Duration::from_secs(5);

/// Fetches the markup (or JSON) body of a page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Returns the body, or `None` when the page does not exist or could not
    /// be fetched.
    ///
    /// # Errors
    ///
    /// Implementations return [`ResolveError::Cancelled`] when `cancel` fires
    /// mid-fetch.
    async fn fetch_page(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ResolveError>;
}

/// reqwest-backed fetcher with progressive retry.
///
/// A 404 is answered with `None` straight away. Any other failure is retried
/// after `backoff * attempt`, up to `max_retries` tries, then answered with
/// `None`.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,
    max_retries: u32,
    backoff: Duration,
}

impl HttpPageFetcher {
    /// # Errors
    ///
    /// Returns [`ResolveError::ClientBuild`] if the HTTP client cannot be built.
    pub fn new(max_retries: u32, backoff: Duration) -> Result<Self, ResolveError> {
        let client = build_client(
            CONNECT_TIMEOUT,
            READ_TIMEOUT,
            &user_agent::default_page_user_agent(),
        )
        .map_err(|e| ResolveError::ClientBuild {
            reason: e.to_string(),
        })?;
        Ok(Self::with_client(client, max_retries, backoff))
    }

    #[must_use]
    pub fn with_client(client: Client, max_retries: u32, backoff: Duration) -> Self {
        Self {
            client,
            max_retries: max_retries.max(1),
            backoff,
        }
    }

    async fn try_once(&self, url: &str) -> Result<Option<String>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        response.text().await.map(Some).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    #[instrument(skip(self, cancel), fields(url = %redact_link(url)))]
    async fn fetch_page(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ResolveError> {
        let shown = redact_link(url);
        for attempt in 1..=self.max_retries {
            if cancel.is_signaled() {
                return Err(ResolveError::cancelled(&shown));
            }
            let outcome = tokio::select! {
                biased;
                () = cancel.signaled() => return Err(ResolveError::cancelled(&shown)),
                outcome = self.try_once(url) => outcome,
            };
            match outcome {
                Ok(Some(body)) => {
                    debug!(attempt, bytes = body.len(), "page fetched");
                    return Ok(Some(body));
                }
                Ok(None) => {
                    debug!("page not found");
                    return Ok(None);
                }
                Err(reason) => {
                    warn!(attempt, max = self.max_retries, %reason, "page fetch failed");
                    if attempt < self.max_retries
                        && cancel.sleep(self.backoff.saturating_mul(attempt)).await.is_err()
                    {
                        return Err(ResolveError::cancelled(&shown));
                    }
                }
            }
        }
        Ok(None)
    }
}
