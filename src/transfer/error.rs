//! Error types for the transfer engine.

use thiserror::Error;

/// Errors that can occur while fetching a payload.
///
/// URLs stored here are already redacted.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        #[source]
        source: reqwest::Error,
    },

    /// Network-level failure before a response arrived (DNS, refused, TLS).
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read deadline exceeded.
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// Non-success response status.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Retry-After header value, when the server sent one.
        retry_after: Option<String>,
    },

    /// The body stream broke off before completion.
    #[error("stream interrupted after {received} bytes fetching {url}: {source}")]
    Stream {
        url: String,
        received: u64,
        #[source]
        source: reqwest::Error,
    },

    /// The link is not a valid absolute URL.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Payload far below the expected size and looks like an HTML page.
    #[error(
        "received markup interstitial instead of file from {url}: {received_bytes} of {expected_bytes} expected bytes\n  Suggestion: the mirror served a captcha or error page; another source will be tried"
    )]
    MarkupInterstitial {
        url: String,
        expected_bytes: u64,
        received_bytes: u64,
    },

    /// The job's cancellation token fired.
    #[error("transfer cancelled: {url}")]
    Cancelled { url: String },
}

impl TransferError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn stream(url: impl Into<String>, received: u64, source: reqwest::Error) -> Self {
        Self::Stream {
            url: url.into(),
            received,
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn markup_interstitial(
        url: impl Into<String>,
        expected_bytes: u64,
        received_bytes: u64,
    ) -> Self {
        Self::MarkupInterstitial {
            url: url.into(),
            expected_bytes,
            received_bytes,
        }
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
