//! Per-job cancellation signal.
//!
//! A [`CancellationToken`] is created when a job enters the queue and is
//! handed to every blocking call made on that job's behalf: HTTP requests,
//! backoff sleeps, countdown waits and file moves. Signaling is one-way; a
//! signaled token never resets.

use std::time::Duration;

use thiserror::Error;
use tracing::trace;

/// Returned by cancellable waits when the token fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// One-way cancellation signal shared between the queue and a worker.
///
/// Clones share state: signaling any clone signals all of them.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    /// Creates a fresh, unsignaled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation. Idempotent.
    pub fn signal(&self) {
        trace!("cancellation signaled");
        self.inner.cancel();
    }

    /// Returns true once [`signal`](Self::signal) has been called on any clone.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Waits up to `timeout` for the signal. Returns true if it fired.
    pub async fn await_signal(&self, timeout: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.inner.cancelled() => true,
            () = tokio::time::sleep(timeout) => self.is_signaled(),
        }
    }

    /// Resolves when the token is signaled.
    pub async fn signaled(&self) {
        self.inner.cancelled().await;
    }

    /// Sleeps for `duration` unless the token fires first.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] as soon as the token is signaled, including when
    /// it was already signaled before the call.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        if self.is_signaled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            () = self.inner.cancelled() => Err(Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
