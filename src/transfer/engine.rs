//! Resilient streaming fetch of a single URL into memory.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Response;
use tracing::{debug, info, instrument, warn};

use super::client::{HttpClient, content_type};
use super::constants::{CHUNK_SIZE, DEFAULT_MAX_STREAM_RESTARTS, SHORT_PAYLOAD_PERCENT};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use super::size::parse_size_hint;
use super::TransferError;
use crate::cancel::CancellationToken;
use crate::redact::redact_link;

/// Upper bound on the buffer reserved up front from a size hint.
const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// Receives percent-complete updates during a transfer.
///
/// Sinks are invoked behind `catch_unwind`; a panicking sink is logged and
/// the transfer carries on.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: f64);
}

impl<F> ProgressSink for F
where
    F: Fn(f64) + Send + Sync,
{
    fn report(&self, percent: f64) {
        self(percent);
    }
}

/// Sink that discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: f64) {}
}

/// A fully received body.
#[derive(Debug, Clone)]
pub struct Payload {
    /// The URL that was fetched, redacted.
    pub url: String,
    pub bytes: Vec<u8>,
    /// Media type reported by the server.
    pub content_type: Option<String>,
    /// Size used for progress and verification, when known.
    pub expected_size: Option<u64>,
    /// Number of times the body stream restarted from zero.
    pub restarts: u32,
}

/// Fetches payloads with retry, restart-from-zero and interstitial detection.
///
/// # Retry Behavior
///
/// - HTTP 429 waits with exponential backoff (or the server's Retry-After if
///   longer), up to the policy's rate-limit attempt limit
/// - Timeouts, connection errors, 408 and 5xx wait `step * attempt`, up to the
///   connection attempt limit
/// - Other statuses fail the candidate immediately
/// - A body stream that breaks off restarts from byte zero, up to
///   `max_stream_restarts` times
///
/// Every wait and every body piece is a cancellation checkpoint.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    client: HttpClient,
    policy: RetryPolicy,
    max_stream_restarts: u32,
    chunk_size: usize,
}

impl TransferEngine {
    #[must_use]
    pub fn new(client: HttpClient, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            max_stream_restarts: DEFAULT_MAX_STREAM_RESTARTS,
            chunk_size: CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_stream_restarts(mut self, max_stream_restarts: u32) -> Self {
        self.max_stream_restarts = max_stream_restarts;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetches `url` into memory.
    ///
    /// `size_hint` is the catalog's human size string; when it does not parse
    /// the Content-Length header is used instead. Without either, progress is
    /// only reported at completion and the short-payload check is skipped.
    ///
    /// # Errors
    ///
    /// - [`TransferError::Cancelled`] as soon as `cancel` fires
    /// - [`TransferError::MarkupInterstitial`] when the body is under 90% of the
    ///   expected size and looks like an HTML page
    /// - the last request error once its retry budget is spent
    #[instrument(skip_all, fields(url = %redact_link(url)))]
    pub async fn fetch(
        &self,
        url: &str,
        size_hint: Option<&str>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Payload, TransferError> {
        let shown = redact_link(url);
        let hint_bytes = size_hint.and_then(parse_size_hint);
        let mut rate_limited_attempts = 0u32;
        let mut transient_attempts = 0u32;
        let mut restarts = 0u32;

        loop {
            if cancel.is_signaled() {
                return Err(TransferError::cancelled(shown));
            }

            let result = tokio::select! {
                biased;
                () = cancel.signaled() => return Err(TransferError::cancelled(shown)),
                result = self.client.get(url) => result,
            };

            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    let failure = classify_error(&error);
                    let attempt = match failure {
                        FailureType::RateLimited => {
                            rate_limited_attempts += 1;
                            rate_limited_attempts
                        }
                        FailureType::Transient => {
                            transient_attempts += 1;
                            transient_attempts
                        }
                        FailureType::Permanent | FailureType::Cancelled => 1,
                    };
                    match self.policy.should_retry(failure, attempt) {
                        RetryDecision::Retry {
                            delay,
                            attempt: next_attempt,
                        } => {
                            let delay = self.server_delay(&error).map_or(delay, |d| d.max(delay));
                            info!(
                                url = %shown,
                                attempt = next_attempt,
                                delay_ms = delay.as_millis(),
                                error = %error,
                                "retrying transfer"
                            );
                            if cancel.sleep(delay).await.is_err() {
                                return Err(TransferError::cancelled(shown));
                            }
                            continue;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(url = %shown, %reason, "not retrying transfer");
                            return Err(error);
                        }
                    }
                }
            };

            let media_type = content_type(&response);
            let expected = hint_bytes
                .or_else(|| response.content_length())
                .filter(|size| *size > 0);

            match self
                .stream_body(response, &shown, expected, progress, cancel)
                .await
            {
                Ok(bytes) => {
                    verify_payload(&shown, &bytes, expected, media_type.as_deref())?;
                    report_progress(progress, 100.0);
                    info!(url = %shown, bytes = bytes.len(), restarts, "transfer complete");
                    return Ok(Payload {
                        url: shown,
                        bytes,
                        content_type: media_type,
                        expected_size: expected,
                        restarts,
                    });
                }
                Err(error @ TransferError::Stream { .. })
                    if restarts < self.max_stream_restarts =>
                {
                    restarts += 1;
                    warn!(
                        url = %shown,
                        restart = restarts,
                        max_restarts = self.max_stream_restarts,
                        error = %error,
                        "body stream interrupted, restarting from zero"
                    );
                    report_progress(progress, 0.0);
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn server_delay(&self, error: &TransferError) -> Option<Duration> {
        match error {
            TransferError::HttpStatus {
                status: 429,
                retry_after: Some(value),
                ..
            } => parse_retry_after(value).map(|d| self.policy.clamp_server_delay(d)),
            _ => None,
        }
    }

    async fn stream_body(
        &self,
        response: Response,
        shown: &str,
        expected: Option<u64>,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TransferError> {
        let capacity = expected
            .and_then(|size| usize::try_from(size).ok())
            .unwrap_or(0)
            .min(MAX_PREALLOCATION);
        let mut buffer = Vec::with_capacity(capacity);
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.signaled() => return Err(TransferError::cancelled(shown)),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| TransferError::stream(shown, buffer.len() as u64, e))?;

            for piece in chunk.chunks(self.chunk_size) {
                if cancel.is_signaled() {
                    return Err(TransferError::cancelled(shown));
                }
                buffer.extend_from_slice(piece);
                if let Some(total) = expected {
                    report_progress(progress, percent_of(buffer.len() as u64, total));
                }
            }
        }

        Ok(buffer)
    }
}

/// Returns true when a body looks like an HTML page rather than a book.
#[must_use]
pub fn looks_like_markup(content_type: Option<&str>, body: &[u8]) -> bool {
    if content_type.is_some_and(|media| media.contains("html")) {
        return true;
    }
    let head = &body[..body.len().min(512)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start().to_ascii_lowercase();
    text.starts_with("<!doctype html") || text.starts_with("<html")
}

fn verify_payload(
    shown: &str,
    bytes: &[u8],
    expected: Option<u64>,
    media_type: Option<&str>,
) -> Result<(), TransferError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let received = bytes.len() as u64;
    let short = u128::from(received) * 100 < u128::from(expected) * u128::from(SHORT_PAYLOAD_PERCENT);
    if !short {
        return Ok(());
    }
    if looks_like_markup(media_type, bytes) {
        warn!(url = %shown, received, expected, "markup interstitial instead of file");
        return Err(TransferError::markup_interstitial(shown, expected, received));
    }
    warn!(url = %shown, received, expected, "payload shorter than expected, accepting");
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn percent_of(received: u64, total: u64) -> f64 {
    received as f64 / total as f64 * 100.0
}

fn report_progress(progress: &dyn ProgressSink, percent: f64) {
    if catch_unwind(AssertUnwindSafe(|| progress.report(percent))).is_err() {
        warn!(percent, "progress sink panicked, continuing transfer");
    }
}
