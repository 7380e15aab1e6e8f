//! Retry classification and backoff for transfer failures.
//!
//! Rate limiting and connection trouble are budgeted separately:
//!
//! - [`FailureType::RateLimited`] (HTTP 429) backs off exponentially from a
//!   long base delay, since mirrors that throttle usually keep throttling for
//!   a while.
//! - [`FailureType::Transient`] (timeouts, refused connections, 408, 5xx)
//!   backs off linearly: `step * attempt`.
//!
//! Each kind has its own attempt limit. Everything else is
//! [`FailureType::Permanent`] and fails the candidate immediately.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bookdl_core::transfer::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default().with_jitter(Duration::ZERO);
//! match policy.should_retry(FailureType::RateLimited, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         assert_eq!(delay, Duration::from_secs(30));
//!         assert_eq!(attempt, 2);
//!     }
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::TransferError;

/// Default attempt limit for HTTP 429 responses (including the first try).
pub const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: u32 = 3;

/// Default first backoff after a 429.
pub const DEFAULT_RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(30);

/// Upper bound on any single rate-limit wait.
pub const DEFAULT_RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(600);

/// Default attempt limit for connection errors and timeouts.
pub const DEFAULT_CONNECTION_MAX_ATTEMPTS: u32 = 3;

/// Default linear backoff step for connection errors and timeouts.
pub const DEFAULT_CONNECTION_BACKOFF_STEP: Duration = Duration::from_secs(10);

/// Default upper bound on random jitter added to each delay.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of transfer failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// HTTP 429.
    RateLimited,
    /// Temporary network or server trouble.
    Transient,
    /// Retrying will not help.
    Permanent,
    /// The job was cancelled; never retried.
    Cancelled,
}

/// Decision on whether to retry a failed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`; `attempt` is the number of the next try.
    Retry { delay: Duration, attempt: u32 },
    /// Give up.
    DoNotRetry { reason: String },
}

/// Backoff configuration for the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    rate_limit_max_attempts: u32,
    rate_limit_base_delay: Duration,
    rate_limit_max_delay: Duration,
    connection_max_attempts: u32,
    connection_backoff_step: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_max_attempts: DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
            rate_limit_base_delay: DEFAULT_RATE_LIMIT_BASE_DELAY,
            rate_limit_max_delay: DEFAULT_RATE_LIMIT_MAX_DELAY,
            connection_max_attempts: DEFAULT_CONNECTION_MAX_ATTEMPTS,
            connection_backoff_step: DEFAULT_CONNECTION_BACKOFF_STEP,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. Attempt limits below 1 are raised to 1.
    #[must_use]
    pub fn new(
        rate_limit_max_attempts: u32,
        rate_limit_base_delay: Duration,
        connection_max_attempts: u32,
        connection_backoff_step: Duration,
    ) -> Self {
        Self {
            rate_limit_max_attempts: rate_limit_max_attempts.max(1),
            rate_limit_base_delay,
            connection_max_attempts: connection_max_attempts.max(1),
            connection_backoff_step,
            ..Self::default()
        }
    }

    /// Overrides the jitter bound. `Duration::ZERO` disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Overrides the cap on a single rate-limit wait.
    #[must_use]
    pub fn with_rate_limit_max_delay(mut self, max_delay: Duration) -> Self {
        self.rate_limit_max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn rate_limit_max_attempts(&self) -> u32 {
        self.rate_limit_max_attempts
    }

    #[must_use]
    pub fn connection_max_attempts(&self) -> u32 {
        self.connection_max_attempts
    }

    /// Decides whether to retry after the `attempt`-th failure of this kind
    /// (1-indexed).
    #[instrument(level = "debug", skip(self))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        let max_attempts = match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::Cancelled => {
                return RetryDecision::DoNotRetry {
                    reason: "cancelled".to_string(),
                };
            }
            FailureType::RateLimited => self.rate_limit_max_attempts,
            FailureType::Transient => self.connection_max_attempts,
        };

        if attempt >= max_attempts {
            debug!(attempt, max = max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({max_attempts}) exhausted"),
            };
        }

        let delay = self.backoff(failure_type, attempt) + self.jitter();
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Delay before the next try, without jitter.
    ///
    /// Rate limits: `base * 2^(attempt-1)`, capped. Connection errors:
    /// `step * attempt`.
    #[must_use]
    pub fn backoff(&self, failure_type: FailureType, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match failure_type {
            FailureType::RateLimited => {
                let factor = 1u32 << (attempt - 1).min(16);
                self.rate_limit_base_delay
                    .saturating_mul(factor)
                    .min(self.rate_limit_max_delay)
            }
            FailureType::Transient => self.connection_backoff_step.saturating_mul(attempt),
            FailureType::Permanent | FailureType::Cancelled => Duration::ZERO,
        }
    }

    /// Caps a server-provided Retry-After wait at the rate-limit ceiling.
    #[must_use]
    pub fn clamp_server_delay(&self, delay: Duration) -> Duration {
        delay.min(self.rate_limit_max_delay)
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Parses a Retry-After header, either delay-seconds or an HTTP-date.
///
/// A date in the past yields a zero delay.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = httpdate::parse_http_date(value).ok()?;
    Some(
        date.duration_since(std::time::SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// Classifies a transfer error for retry decisions.
#[must_use]
pub fn classify_error(error: &TransferError) -> FailureType {
    match error {
        TransferError::HttpStatus { status, .. } => classify_http_status(*status),
        TransferError::Timeout { .. } | TransferError::Network { .. } => FailureType::Transient,
        TransferError::Cancelled { .. } => FailureType::Cancelled,
        TransferError::ClientBuild { .. }
        | TransferError::Stream { .. }
        | TransferError::InvalidUrl { .. }
        | TransferError::MarkupInterstitial { .. } => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code.
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        429 => FailureType::RateLimited,
        408 | 500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(
            3,
            Duration::from_millis(100),
            3,
            Duration::from_millis(40),
        )
        .with_jitter(Duration::ZERO)
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_classify_http_status() {
        assert_eq!(classify_http_status(429), FailureType::RateLimited);
        assert_eq!(classify_http_status(503), FailureType::Transient);
        assert_eq!(classify_http_status(500), FailureType::Transient);
        assert_eq!(classify_http_status(408), FailureType::Transient);
        assert_eq!(classify_http_status(404), FailureType::Permanent);
        assert_eq!(classify_http_status(403), FailureType::Permanent);
    }

    #[test]
    fn test_classify_error_variants() {
        assert_eq!(
            classify_error(&TransferError::timeout("u")),
            FailureType::Transient
        );
        assert_eq!(
            classify_error(&TransferError::http_status("u", 429)),
            FailureType::RateLimited
        );
        assert_eq!(
            classify_error(&TransferError::cancelled("u")),
            FailureType::Cancelled
        );
        assert_eq!(
            classify_error(&TransferError::markup_interstitial("u", 10, 1)),
            FailureType::Permanent
        );
    }

    // ==================== Backoff Tests ====================

    #[test]
    fn test_rate_limit_backoff_doubles() {
        let policy = fast_policy();
        let delays: Vec<Duration> = (1..=4)
            .map(|attempt| policy.backoff(FailureType::RateLimited, attempt))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn test_rate_limit_backoff_is_capped() {
        let policy = fast_policy().with_rate_limit_max_delay(Duration::from_millis(250));
        assert_eq!(
            policy.backoff(FailureType::RateLimited, 10),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_connection_backoff_is_linear() {
        let policy = fast_policy();
        assert_eq!(
            policy.backoff(FailureType::Transient, 1),
            Duration::from_millis(40)
        );
        assert_eq!(
            policy.backoff(FailureType::Transient, 3),
            Duration::from_millis(120)
        );
    }

    #[test]
    fn test_should_retry_stops_at_limit() {
        let policy = fast_policy();
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 3),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_rate_limit_delays_strictly_increase() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), 1, Duration::ZERO);
        let mut previous = Duration::ZERO;
        for attempt in 1..5 {
            let RetryDecision::Retry { delay, .. } =
                policy.should_retry(FailureType::RateLimited, attempt)
            else {
                panic!("attempt {attempt} should retry");
            };
            assert!(delay > previous, "{delay:?} <= {previous:?}");
            previous = delay;
        }
    }

    #[test]
    fn test_permanent_and_cancelled_never_retry() {
        let policy = fast_policy();
        assert!(matches!(
            policy.should_retry(FailureType::Permanent, 1),
            RetryDecision::DoNotRetry { .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::Cancelled, 1),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = fast_policy().with_jitter(Duration::from_millis(5));
        for _ in 0..20 {
            let RetryDecision::Retry { delay, .. } =
                policy.should_retry(FailureType::Transient, 1)
            else {
                panic!("should retry");
            };
            assert!(delay >= Duration::from_millis(40));
            assert!(delay <= Duration::from_millis(45));
        }
    }

    #[test]
    fn test_attempt_limits_floor_at_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, 0, Duration::ZERO);
        assert_eq!(policy.rate_limit_max_attempts(), 1);
        assert_eq!(policy.connection_max_attempts(), 1);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("soon"), None);
        assert_eq!(parse_retry_after("-5"), None);
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_future_date() {
        let future = std::time::SystemTime::now() + Duration::from_secs(60);
        let delay = parse_retry_after(&httpdate::fmt_http_date(future)).unwrap();
        assert!(
            delay >= Duration::from_secs(55) && delay <= Duration::from_secs(60),
            "expected ~60s, got {delay:?}"
        );
    }
}
