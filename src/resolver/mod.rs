//! Turning candidate links into fetchable URLs.
//!
//! A candidate link from the catalog is rarely the file itself. It may be a
//! mirror page that has to be fetched and searched for the real download
//! anchor, a partner page that makes the visitor wait out a countdown first,
//! or a credentialed JSON API that returns the URL.
//!
//! # Architecture
//!
//! - [`Resolver`] - async trait each resolution strategy implements
//! - [`ResolverRegistry`] - priority-ordered collection; first handler to produce a step wins
//! - [`ResolveStep`] - a URL, a countdown gate to wait out, or "not here"
//! - [`DirectResolver`] - links that already point at a book file
//! - [`FastDownloadResolver`] - credentialed fast-download JSON API
//! - [`PageResolver`] - fetches an intermediary page and extracts the download link
//! - [`PageFetcher`] / [`HttpPageFetcher`] - page retrieval seam
//! - [`LinkExtractor`] / [`MarkupLinkExtractor`] - markup parsing seam
//!
//! Countdown gates are surfaced to the caller rather than waited out here, so
//! the caller can bound and cancel the wait.

mod direct;
mod error;
mod fast_download;
mod fetcher;
mod markup;
mod page;
mod registry;

pub use direct::DirectResolver;
pub use error::ResolveError;
pub use fast_download::{FastDownloadResolver, fast_download_link};
pub use fetcher::{
    DEFAULT_PAGE_FETCH_BACKOFF, DEFAULT_PAGE_FETCH_MAX_RETRIES, HttpPageFetcher, PageFetcher,
};
pub use markup::{Extraction, LinkExtractor, MarkupLinkExtractor};
pub use page::PageResolver;
pub use registry::ResolverRegistry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancellationToken;

/// Builds the registry used by the download worker.
///
/// Direct file links and fast-download API links are handled by specialized
/// resolvers; every other http(s) link goes through the page resolver.
#[must_use]
pub fn build_default_resolver_registry(
    fetcher: Arc<dyn PageFetcher>,
    libgen_mirror_host: Option<String>,
) -> ResolverRegistry {
    let mut registry = ResolverRegistry::new();
    registry.register(Box::new(FastDownloadResolver::new(Arc::clone(&fetcher))));
    registry.register(Box::new(DirectResolver::new()));
    registry.register(Box::new(
        PageResolver::new(fetcher, Arc::new(MarkupLinkExtractor::new()))
            .with_libgen_mirror_host(libgen_mirror_host),
    ));
    registry
}

/// Priority level for resolver ordering.
///
/// Derives `Ord` so that `Specialized < General < Fallback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolverPriority {
    /// Handles one recognisable link shape.
    Specialized = 0,
    /// Handles a family of sources.
    General = 1,
    /// Handles anything.
    Fallback = 2,
}

/// A resolved, fetchable URL with optional metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    /// Anything learned along the way (resolver name, page URL, ...).
    pub metadata: HashMap<String, String>,
}

impl ResolvedUrl {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(url: impl Into<String>, metadata: HashMap<String, String>) -> Self {
        Self {
            url: url.into(),
            metadata,
        }
    }
}

/// Result of a single resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveStep {
    /// A URL ready for transfer.
    Url(ResolvedUrl),
    /// The source asks the visitor to wait this long and come back.
    Countdown(Duration),
    /// This resolver found nothing for the link.
    Unavailable(String),
}

/// A strategy for resolving one family of candidate links.
///
/// Uses `async_trait` so resolvers can be stored as `Box<dyn Resolver>`.
#[async_trait]
pub trait Resolver: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> ResolverPriority;

    /// Returns true if this resolver understands `link`.
    fn can_handle(&self, link: &str) -> bool;

    /// Attempts one resolution of `link`. Any network wait inside must honour
    /// `cancel`.
    async fn resolve(
        &self,
        link: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolveStep, ResolveError>;
}
