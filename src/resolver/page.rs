//! Intermediary-page resolver.
//!
//! Mirror and partner links lead to an HTML page rather than the file. The
//! page is fetched and handed to a [`LinkExtractor`], which either finds the
//! download anchor or reports a countdown gate.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{
    Extraction, LinkExtractor, PageFetcher, ResolveError, ResolveStep, ResolvedUrl, Resolver,
    ResolverPriority,
};
use crate::cancel::CancellationToken;
use crate::catalog::SourceKind;
use crate::redact::redact_link;

/// Fallback resolver for any http(s) link.
pub struct PageResolver {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn LinkExtractor>,
    libgen_mirror_host: Option<String>,
}

impl PageResolver {
    #[must_use]
    pub fn new(fetcher: Arc<dyn PageFetcher>, extractor: Arc<dyn LinkExtractor>) -> Self {
        Self {
            fetcher,
            extractor,
            libgen_mirror_host: None,
        }
    }

    /// Points libgen links at a preferred mirror host.
    #[must_use]
    pub fn with_libgen_mirror_host(mut self, host: Option<String>) -> Self {
        self.libgen_mirror_host = host
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        self
    }

    fn rewrite_mirror(&self, link: &str) -> String {
        let Some(host) = self.libgen_mirror_host.as_deref() else {
            return link.to_string();
        };
        if SourceKind::classify(link) != SourceKind::Libgen {
            return link.to_string();
        }
        match Url::parse(link) {
            Ok(mut url) => {
                if url.set_host(Some(host)).is_err() {
                    warn!(host, "invalid libgen mirror host, keeping original link");
                    return link.to_string();
                }
                url.to_string()
            }
            Err(_) => link.to_string(),
        }
    }
}

impl std::fmt::Debug for PageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageResolver")
            .field("libgen_mirror_host", &self.libgen_mirror_host)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Resolver for PageResolver {
    fn name(&self) -> &'static str {
        "page"
    }

    fn priority(&self) -> ResolverPriority {
        ResolverPriority::Fallback
    }

    fn can_handle(&self, link: &str) -> bool {
        Url::parse(link).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }

    #[instrument(skip(self, cancel), fields(resolver = "page", link = %redact_link(link)))]
    async fn resolve(
        &self,
        link: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolveStep, ResolveError> {
        let page_url = self.rewrite_mirror(link);
        if page_url != link {
            debug!(page_url = %redact_link(&page_url), "rewrote libgen mirror host");
        }

        let Some(markup) = self.fetcher.fetch_page(&page_url, cancel).await? else {
            return Ok(ResolveStep::Unavailable("page not found".to_string()));
        };

        match self.extractor.extract(&page_url, &markup) {
            Extraction::Link(url) => {
                debug!(url = %redact_link(&url), "download link extracted");
                let metadata = HashMap::from([
                    ("resolver".to_string(), "page".to_string()),
                    ("page_url".to_string(), redact_link(&page_url)),
                ]);
                Ok(ResolveStep::Url(ResolvedUrl::with_metadata(url, metadata)))
            }
            Extraction::Countdown(wait) => {
                debug!(wait_secs = wait.as_secs(), "countdown gate on page");
                Ok(ResolveStep::Countdown(wait))
            }
            Extraction::Nothing => Ok(ResolveStep::Unavailable(
                "no download link on page".to_string(),
            )),
        }
    }
}
