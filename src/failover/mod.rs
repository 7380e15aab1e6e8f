//! Multi-source failover for a single job.
//!
//! The protocol walks a job's candidate links in order. Each link is
//! resolved (waiting out countdown gates a bounded number of times), fetched
//! through the [`TransferEngine`], and persisted through the
//! [`ArtifactStore`]. The first link that makes it all the way wins; every
//! link that does not is recorded as a [`FailedAttempt`].

mod artifact;

pub use artifact::{ArtifactError, ArtifactStore, detect_format};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::queue::{Job, JobOutcome};
use crate::redact::redact_link;
use crate::resolver::{ResolveStep, ResolvedUrl, ResolverRegistry, fast_download_link};
use crate::transfer::{ProgressSink, TransferEngine};

/// Default number of countdown gates waited out per candidate.
pub const DEFAULT_MAX_COUNTDOWN_GATES: u32 = 3;

/// Default cap on a single countdown wait.
pub const DEFAULT_MAX_COUNTDOWN_WAIT: Duration = Duration::from_secs(600);

/// Reason recorded when every candidate failed.
pub const NO_REACHABLE_SOURCE: &str = "no reachable source";

/// Where a candidate fell over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStage {
    Resolve,
    Transfer,
    Persist,
}

impl fmt::Display for AttemptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "resolve",
            Self::Transfer => "transfer",
            Self::Persist => "persist",
        })
    }
}

/// One candidate link that did not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    /// The candidate link, redacted.
    pub link: String,
    pub stage: AttemptStage,
    pub reason: String,
}

/// Everything the protocol learned while running a job.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverReport {
    pub outcome: JobOutcome,
    pub failed_attempts: Vec<FailedAttempt>,
    /// The URL the artifact came from, redacted.
    pub source_url: Option<String>,
}

impl FailoverReport {
    fn new(outcome: JobOutcome, failed_attempts: Vec<FailedAttempt>) -> Self {
        Self {
            outcome,
            failed_attempts,
            source_url: None,
        }
    }
}

/// Credentials for the fast-download API.
#[derive(Clone, PartialEq, Eq)]
pub struct FastPath {
    pub base_url: String,
    pub key: String,
}

impl fmt::Debug for FastPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastPath")
            .field("base_url", &self.base_url)
            .field("key", &"***")
            .finish()
    }
}

enum CandidateError {
    Failed(FailedAttempt),
    Cancelled,
}

/// Turns a job's candidate links into a delivered artifact.
#[derive(Debug)]
pub struct FailoverProtocol {
    registry: Arc<ResolverRegistry>,
    engine: Arc<TransferEngine>,
    store: ArtifactStore,
    fast_path: Option<FastPath>,
    max_countdown_gates: u32,
    max_countdown_wait: Duration,
}

impl FailoverProtocol {
    #[must_use]
    pub fn new(
        registry: Arc<ResolverRegistry>,
        engine: Arc<TransferEngine>,
        store: ArtifactStore,
    ) -> Self {
        Self {
            registry,
            engine,
            store,
            fast_path: None,
            max_countdown_gates: DEFAULT_MAX_COUNTDOWN_GATES,
            max_countdown_wait: DEFAULT_MAX_COUNTDOWN_WAIT,
        }
    }

    /// Enables the privileged fast-download link, tried before all others.
    #[must_use]
    pub fn with_fast_path(mut self, fast_path: Option<FastPath>) -> Self {
        self.fast_path = fast_path.filter(|fp| !fp.key.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_countdown_limits(mut self, max_gates: u32, max_wait: Duration) -> Self {
        self.max_countdown_gates = max_gates;
        self.max_countdown_wait = max_wait;
        self
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Candidate links in the order they will be tried.
    #[must_use]
    pub fn candidates_for(&self, job: &Job) -> Vec<String> {
        let mut links = job.candidate_links.clone();
        if let Some(fp) = &self.fast_path {
            let fast = fast_download_link(&fp.base_url, &job.id, &fp.key);
            if !links.contains(&fast) {
                links.insert(0, fast);
            }
        }
        links
    }

    /// Runs the protocol for `job`.
    ///
    /// Cancellation takes precedence over everything: once the job's token is
    /// observed the outcome is [`JobOutcome::Cancelled`] and no partial
    /// output is left behind.
    #[instrument(skip_all, fields(job_id = %job.id))]
    pub async fn run(&self, job: &Job, progress: &dyn ProgressSink) -> FailoverReport {
        let cancel = &job.token;
        let links = self.candidates_for(job);
        let mut failed = Vec::new();
        debug!(candidates = links.len(), "starting failover");

        for (index, link) in links.iter().enumerate() {
            if cancel.is_signaled() {
                info!("job cancelled, stopping failover");
                return FailoverReport::new(JobOutcome::Cancelled, failed);
            }
            debug!(index, link = %redact_link(link), "trying candidate");

            match self.try_candidate(job, link, progress, cancel).await {
                Ok((path, resolved)) => {
                    info!(
                        index,
                        path = %path.display(),
                        failed_attempts = failed.len(),
                        "artifact delivered"
                    );
                    return FailoverReport {
                        outcome: JobOutcome::Available { path },
                        failed_attempts: failed,
                        source_url: Some(redact_link(&resolved.url)),
                    };
                }
                Err(CandidateError::Cancelled) => {
                    info!("job cancelled during transfer");
                    return FailoverReport::new(JobOutcome::Cancelled, failed);
                }
                Err(CandidateError::Failed(attempt)) => {
                    warn!(
                        link = %attempt.link,
                        stage = %attempt.stage,
                        reason = %attempt.reason,
                        "candidate failed"
                    );
                    failed.push(attempt);
                }
            }
        }

        if cancel.is_signaled() {
            return FailoverReport::new(JobOutcome::Cancelled, failed);
        }
        warn!(tried = links.len(), "all candidates exhausted");
        FailoverReport::new(
            JobOutcome::Failed {
                reason: NO_REACHABLE_SOURCE.to_string(),
            },
            failed,
        )
    }

    async fn try_candidate(
        &self,
        job: &Job,
        link: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, ResolvedUrl), CandidateError> {
        let fail = |stage, reason: String| {
            CandidateError::Failed(FailedAttempt {
                link: redact_link(link),
                stage,
                reason,
            })
        };

        let resolved = self
            .resolve_candidate(link, cancel)
            .await
            .map_err(|reason| fail(AttemptStage::Resolve, reason))?;

        let payload = match self
            .engine
            .fetch(&resolved.url, job.record.size.as_deref(), progress, cancel)
            .await
        {
            Ok(payload) => payload,
            Err(e) if e.is_cancelled() => return Err(CandidateError::Cancelled),
            Err(e) => return Err(fail(AttemptStage::Transfer, e.to_string())),
        };

        match self
            .store
            .persist(&job.id, &payload.bytes, &job.record.file_extension(), cancel)
            .await
        {
            Ok(path) => Ok((path, resolved)),
            Err(ArtifactError::Cancelled) => Err(CandidateError::Cancelled),
            Err(e) => Err(fail(AttemptStage::Persist, e.to_string())),
        }
    }

    /// Resolves one link, waiting out at most `max_countdown_gates` gates.
    ///
    /// A cancellation during a wait abandons only this link.
    async fn resolve_candidate(
        &self,
        link: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedUrl, String> {
        let mut gates = 0u32;
        loop {
            match self.registry.resolve(link, cancel).await {
                Ok(ResolveStep::Url(resolved)) => return Ok(resolved),
                Ok(ResolveStep::Unavailable(reason)) => return Err(reason),
                Ok(ResolveStep::Countdown(wait)) => {
                    gates += 1;
                    if gates > self.max_countdown_gates {
                        return Err(format!(
                            "countdown gate still present after {} waits",
                            self.max_countdown_gates
                        ));
                    }
                    let wait = wait.min(self.max_countdown_wait);
                    info!(gate = gates, wait_secs = wait.as_secs(), "waiting out countdown gate");
                    if cancel.sleep(wait).await.is_err() {
                        return Err("cancelled during countdown wait".to_string());
                    }
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::BookRecord;
    use crate::transfer::{HttpClient, RetryPolicy};

    fn protocol() -> FailoverProtocol {
        let engine = TransferEngine::new(
            HttpClient::new().unwrap(),
            RetryPolicy::new(1, Duration::ZERO, 1, Duration::ZERO),
        );
        FailoverProtocol::new(
            Arc::new(ResolverRegistry::new()),
            Arc::new(engine),
            ArtifactStore::new("staging", "delivery"),
        )
    }

    fn job(links: &[&str]) -> Job {
        Job {
            id: "abc".to_string(),
            record: BookRecord::new("abc"),
            candidate_links: links.iter().map(|s| (*s).to_string()).collect(),
            priority: 0,
            status: crate::queue::JobStatus::Downloading,
            progress: 0.0,
            artifact_path: None,
            last_error: None,
            token: CancellationToken::new(),
            seq: 0,
        }
    }

    #[test]
    fn test_fast_path_prepended_once() {
        let fp = FastPath {
            base_url: "https://aa.example".to_string(),
            key: "k".to_string(),
        };
        let protocol = protocol().with_fast_path(Some(fp));
        let fast = "https://aa.example/dyn/api/fast_download.json?md5=abc&key=k";
        assert_eq!(
            protocol.candidates_for(&job(&["https://libgen.li/a"])),
            vec![fast.to_string(), "https://libgen.li/a".to_string()]
        );
        assert_eq!(protocol.candidates_for(&job(&[fast])), vec![fast.to_string()]);
    }

    #[test]
    fn test_blank_key_disables_fast_path() {
        let fp = FastPath {
            base_url: "https://aa.example".to_string(),
            key: "  ".to_string(),
        };
        let protocol = protocol().with_fast_path(Some(fp));
        assert_eq!(protocol.candidates_for(&job(&[])), Vec::<String>::new());
    }

    #[test]
    fn test_fast_path_debug_hides_key() {
        let fp = FastPath {
            base_url: "https://aa.example".to_string(),
            key: "secret".to_string(),
        };
        assert!(!format!("{fp:?}").contains("secret"));
    }

    #[tokio::test]
    async fn test_no_candidates_fails() {
        let report = protocol().run(&job(&[]), &crate::transfer::NoProgress).await;
        assert_eq!(
            report.outcome,
            JobOutcome::Failed {
                reason: NO_REACHABLE_SOURCE.to_string()
            }
        );
        assert!(report.failed_attempts.is_empty());
    }

    #[tokio::test]
    async fn test_signaled_token_cancels_before_first_link() {
        let job = job(&["https://cdn.example/book.epub"]);
        job.token.signal();
        let report = protocol().run(&job, &crate::transfer::NoProgress).await;
        assert_eq!(report.outcome, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_unresolvable_links_recorded() {
        let report = protocol()
            .run(&job(&["https://a.example/x", "https://b.example/y"]), &crate::transfer::NoProgress)
            .await;
        assert_eq!(report.failed_attempts.len(), 2);
        assert!(report.failed_attempts.iter().all(|a| a.stage == AttemptStage::Resolve));
    }
}
