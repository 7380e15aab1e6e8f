//! Credentialed fast-download API resolver.
//!
//! Members with an access key can ask the catalog's API for a direct,
//! unthrottled URL: `GET {base}/dyn/api/fast_download.json?md5={id}&key={key}`
//! answers `{"download_url": "..."}` or `{"error": "..."}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use super::{PageFetcher, ResolveError, ResolveStep, ResolvedUrl, Resolver, ResolverPriority};
use crate::cancel::CancellationToken;
use crate::redact::redact_link;

/// Builds the fast-download API link for a book id.
#[must_use]
pub fn fast_download_link(base_url: &str, id: &str, key: &str) -> String {
    format!(
        "{}/dyn/api/fast_download.json?md5={id}&key={key}",
        base_url.trim_end_matches('/')
    )
}

#[derive(Debug, Deserialize)]
struct FastDownloadResponse {
    download_url: Option<String>,
    error: Option<String>,
}

/// Resolves fast-download API links through a [`PageFetcher`].
pub struct FastDownloadResolver {
    fetcher: Arc<dyn PageFetcher>,
}

impl FastDownloadResolver {
    #[must_use]
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self { fetcher }
    }
}

impl std::fmt::Debug for FastDownloadResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastDownloadResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl Resolver for FastDownloadResolver {
    fn name(&self) -> &'static str {
        "fast_download"
    }

    fn priority(&self) -> ResolverPriority {
        ResolverPriority::Specialized
    }

    fn can_handle(&self, link: &str) -> bool {
        link.contains("/dyn/api/fast_download.json")
    }

    #[instrument(skip(self, cancel), fields(resolver = "fast_download", link = %redact_link(link)))]
    async fn resolve(
        &self,
        link: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolveStep, ResolveError> {
        let shown = redact_link(link);
        let Some(body) = self.fetcher.fetch_page(link, cancel).await? else {
            return Ok(ResolveStep::Unavailable(
                "fast download API unreachable".to_string(),
            ));
        };
        let response: FastDownloadResponse = serde_json::from_str(&body)
            .map_err(|e| ResolveError::invalid_response(&shown, e.to_string()))?;
        match response.download_url.filter(|url| !url.trim().is_empty()) {
            Some(url) => Ok(ResolveStep::Url(ResolvedUrl::new(url))),
            None => Ok(ResolveStep::Unavailable(response.error.unwrap_or_else(|| {
                "fast download API returned no download_url".to_string()
            }))),
        }
    }
}
