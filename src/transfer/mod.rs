//! Streaming payload transfer with retry, restart and integrity checks.
//!
//! # Features
//!
//! - Separate connect and read timeouts
//! - Exponential backoff for rate limiting, linear backoff for connection trouble
//! - Restart from byte zero when a body stream breaks off
//! - Rejection of HTML interstitials served in place of a book
//! - Cancellation checked before each request, during every wait and per 8 KiB piece
//!
//! # Example
//!
//! ```no_run
//! use bookdl_core::cancel::CancellationToken;
//! use bookdl_core::transfer::{HttpClient, NoProgress, RetryPolicy, TransferEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TransferEngine::new(HttpClient::new()?, RetryPolicy::default());
//! let payload = engine
//!     .fetch("https://mirror.example/book.epub", Some("1.2 MB"), &NoProgress, &CancellationToken::new())
//!     .await?;
//! println!("received {} bytes", payload.bytes.len());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod engine;
mod error;
mod retry;
mod size;

pub use client::{HttpClient, content_type};
pub(crate) use client::build_client;
pub use engine::{NoProgress, Payload, ProgressSink, TransferEngine, looks_like_markup};
pub use error::TransferError;
pub use retry::{
    DEFAULT_CONNECTION_BACKOFF_STEP, DEFAULT_CONNECTION_MAX_ATTEMPTS, DEFAULT_RATE_LIMIT_BASE_DELAY,
    DEFAULT_RATE_LIMIT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error,
    classify_http_status, parse_retry_after,
};
pub use size::parse_size_hint;
