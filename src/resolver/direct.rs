//! Direct resolver - passthrough for links that already point at a book file.

use async_trait::async_trait;

use super::{ResolveError, ResolveStep, ResolvedUrl, Resolver, ResolverPriority};
use crate::cancel::CancellationToken;
use crate::catalog::has_book_extension;

/// Passes links ending in a known book extension through unchanged.
#[derive(Debug, Default)]
pub struct DirectResolver;

impl DirectResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Resolver for DirectResolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn priority(&self) -> ResolverPriority {
        ResolverPriority::Specialized
    }

    fn can_handle(&self, link: &str) -> bool {
        has_book_extension(link)
    }

    async fn resolve(
        &self,
        link: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolveStep, ResolveError> {
        if cancel.is_signaled() {
            return Err(ResolveError::cancelled(link));
        }
        Ok(ResolveStep::Url(ResolvedUrl::new(link)))
    }
}
