//! Error types for link resolution.

use thiserror::Error;

/// Errors that can occur while turning a candidate link into a fetchable URL.
///
/// Inputs stored here are already redacted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No registered resolver accepts the link.
    #[error(
        "no resolver found for '{input}'\n  Suggestion: check the link or register a resolver for this source"
    )]
    NoResolver { input: String },

    /// Every applicable resolver failed.
    #[error("all resolvers failed for '{input}': tried {tried_count} resolver(s), last: {last_reason}")]
    AllResolversFailed {
        input: String,
        tried_count: usize,
        last_reason: String,
    },

    /// A page or API request failed.
    #[error("request failed for '{url}': {reason}")]
    Request { url: String, reason: String },

    /// The page or API answered with something unusable.
    #[error("unexpected response from '{url}': {reason}")]
    InvalidResponse { url: String, reason: String },

    /// The HTTP client could not be constructed.
    #[error("failed to build resolver HTTP client: {reason}")]
    ClientBuild { reason: String },

    /// The job's cancellation token fired.
    #[error("resolution cancelled for '{input}'")]
    Cancelled { input: String },
}

impl ResolveError {
    #[must_use]
    pub fn no_resolver(input: &str) -> Self {
        Self::NoResolver {
            input: input.to_string(),
        }
    }

    #[must_use]
    pub fn all_failed(input: &str, tried_count: usize, last_reason: impl Into<String>) -> Self {
        Self::AllResolversFailed {
            input: input.to_string(),
            tried_count,
            last_reason: last_reason.into(),
        }
    }

    #[must_use]
    pub fn request(url: &str, reason: impl Into<String>) -> Self {
        Self::Request {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn invalid_response(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn cancelled(input: &str) -> Self {
        Self::Cancelled {
            input: input.to_string(),
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
