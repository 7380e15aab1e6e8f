//! Resolver registry with priority-ordered dispatch.

use tracing::{debug, info, warn};

use super::{ResolveError, ResolveStep, Resolver};
use crate::cancel::CancellationToken;
use crate::redact::redact_link;

/// A priority-ordered collection of resolvers.
///
/// Resolvers are tried in priority order (Specialized, General, Fallback);
/// within a level, in registration order.
pub struct ResolverRegistry {
    resolvers: Vec<Box<dyn Resolver>>,
}

impl ResolverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            resolvers: Vec::new(),
        }
    }

    #[tracing::instrument(skip(self, resolver), fields(resolver_name))]
    pub fn register(&mut self, resolver: Box<dyn Resolver>) {
        tracing::Span::current().record("resolver_name", resolver.name());
        debug!(
            name = resolver.name(),
            priority = ?resolver.priority(),
            "registering resolver"
        );
        self.resolvers.push(resolver);
    }

    #[must_use]
    pub fn resolver_count(&self) -> usize {
        self.resolvers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    /// Resolvers that accept `link`, in the order they will be tried.
    #[must_use]
    pub fn find_handlers(&self, link: &str) -> Vec<&dyn Resolver> {
        let mut handlers: Vec<&dyn Resolver> = self
            .resolvers
            .iter()
            .filter(|r| r.can_handle(link))
            .map(AsRef::as_ref)
            .collect();
        handlers.sort_by_key(|r| r.priority());
        handlers
    }

    /// Runs the first applicable resolver that produces a URL or a countdown.
    ///
    /// Handlers answering [`ResolveStep::Unavailable`] or an error are skipped
    /// in favour of the next one.
    ///
    /// # Errors
    ///
    /// - [`ResolveError::NoResolver`] if nothing accepts the link
    /// - [`ResolveError::Cancelled`] as soon as any handler reports cancellation
    /// - [`ResolveError::AllResolversFailed`] if every handler came up empty
    #[tracing::instrument(skip(self, cancel), fields(link = %redact_link(link)))]
    pub async fn resolve(
        &self,
        link: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolveStep, ResolveError> {
        let shown = redact_link(link);
        let handlers = self.find_handlers(link);
        if handlers.is_empty() {
            return Err(ResolveError::no_resolver(&shown));
        }

        let mut last_reason = String::new();
        for handler in &handlers {
            if cancel.is_signaled() {
                return Err(ResolveError::cancelled(&shown));
            }
            debug!(resolver = handler.name(), "trying resolver");
            match handler.resolve(link, cancel).await {
                Ok(ResolveStep::Unavailable(reason)) => {
                    debug!(resolver = handler.name(), %reason, "resolver found nothing, trying next");
                    last_reason = reason;
                }
                Ok(step) => {
                    info!(resolver = handler.name(), step = ?step_kind(&step), "resolution step produced");
                    return Ok(step);
                }
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => {
                    warn!(resolver = handler.name(), error = %error, "resolver returned error");
                    last_reason = error.to_string();
                }
            }
        }

        Err(ResolveError::all_failed(&shown, handlers.len(), last_reason))
    }
}

fn step_kind(step: &ResolveStep) -> &'static str {
    match step {
        ResolveStep::Url(_) => "url",
        ResolveStep::Countdown(_) => "countdown",
        ResolveStep::Unavailable(_) => "unavailable",
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.resolvers.iter().map(|r| r.name()).collect();
        f.debug_struct("ResolverRegistry")
            .field("resolver_count", &self.resolvers.len())
            .field("resolvers", &names)
            .finish()
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
