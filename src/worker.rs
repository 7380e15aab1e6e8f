//! The unit of work the coordinator runs for each dequeued job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{Catalog, SourcePreference};
use crate::config::Settings;
use crate::failover::{ArtifactStore, FailoverProtocol, NO_REACHABLE_SOURCE};
use crate::queue::{Job, JobOutcome, JobQueue};
use crate::resolver::{HttpPageFetcher, build_default_resolver_registry};
use crate::transfer::{HttpClient, ProgressSink, TransferEngine};

/// Runs one job to completion.
///
/// The coordinator only sees this trait, so tests can drive it with stub
/// runners and the failover protocol stays out of the scheduling code.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job) -> JobOutcome;
}

/// Errors from assembling a [`DownloadWorker`] out of [`Settings`].
#[derive(Debug, Error)]
pub enum WorkerBuildError {
    #[error("failed to build HTTP client: {reason}")]
    HttpClient { reason: String },
}

const MILESTONES: [u8; 5] = [25, 50, 75, 90, 100];

/// Progress sink that writes into the queue and logs milestone crossings.
struct QueueProgress {
    queue: Arc<JobQueue>,
    job_id: String,
    last_milestone: AtomicU8,
}

impl QueueProgress {
    fn new(queue: Arc<JobQueue>, job_id: &str) -> Self {
        Self {
            queue,
            job_id: job_id.to_string(),
            last_milestone: AtomicU8::new(0),
        }
    }
}

impl ProgressSink for QueueProgress {
    fn report(&self, percent: f64) {
        self.queue.update_progress(&self.job_id, percent);

        let reached = MILESTONES
            .iter()
            .rev()
            .copied()
            .find(|m| percent >= f64::from(*m))
            .unwrap_or(0);
        // A restart resets progress, so milestones may be crossed again.
        let previous = self.last_milestone.swap(reached, Ordering::Relaxed);
        if reached > previous {
            debug!(job_id = %self.job_id, milestone = reached, "download progress");
        }
    }
}

/// Default [`JobRunner`]: refreshes candidates if needed, then runs the
/// failover protocol with progress flowing into the queue.
pub struct DownloadWorker {
    queue: Arc<JobQueue>,
    catalog: Option<Arc<dyn Catalog>>,
    protocol: Arc<FailoverProtocol>,
    preference: SourcePreference,
}

impl DownloadWorker {
    #[must_use]
    pub fn new(queue: Arc<JobQueue>, protocol: Arc<FailoverProtocol>) -> Self {
        Self {
            queue,
            catalog: None,
            protocol,
            preference: SourcePreference::default(),
        }
    }

    /// Catalog consulted when a job arrives without candidate links.
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    #[must_use]
    pub fn with_preference(mut self, preference: SourcePreference) -> Self {
        self.preference = preference;
        self
    }

    /// Wires the default HTTP stack from `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerBuildError::HttpClient`] if either HTTP client fails
    /// to build.
    pub fn from_settings(
        queue: Arc<JobQueue>,
        catalog: Option<Arc<dyn Catalog>>,
        settings: &Settings,
    ) -> Result<Self, WorkerBuildError> {
        let fetcher = HttpPageFetcher::new(
            settings.page_fetch_max_retries,
            settings.page_fetch_backoff(),
        )
        .map_err(|e| WorkerBuildError::HttpClient {
            reason: e.to_string(),
        })?;
        let registry =
            build_default_resolver_registry(Arc::new(fetcher), settings.libgen_mirror_host.clone());

        let client = HttpClient::with_timeouts(settings.connect_timeout(), settings.read_timeout())
            .map_err(|e| WorkerBuildError::HttpClient {
                reason: e.to_string(),
            })?;
        let engine = TransferEngine::new(client, settings.retry_policy())
            .with_max_stream_restarts(settings.max_stream_restarts);

        let store = ArtifactStore::new(settings.staging_dir(), settings.delivery_dir.clone())
            .with_format_detection(settings.detect_format)
            .with_post_process(settings.post_process_command.clone());

        let protocol = FailoverProtocol::new(Arc::new(registry), Arc::new(engine), store)
            .with_fast_path(settings.fast_path())
            .with_countdown_limits(settings.max_countdown_gates, settings.max_countdown_wait());

        let mut worker =
            Self::new(queue, Arc::new(protocol)).with_preference(settings.source_preference());
        if let Some(catalog) = catalog {
            worker = worker.with_catalog(catalog);
        }
        Ok(worker)
    }

    /// Fetches fresh candidates from the catalog for a job that has none.
    async fn refresh_candidates(&self, job: &mut Job) {
        let Some(catalog) = &self.catalog else {
            return;
        };
        match catalog.get_details(&job.id).await {
            Ok(Some(record)) => {
                let links = self.preference.order(&record.download_urls);
                info!(job_id = %job.id, links = links.len(), "refreshed candidate links");
                self.queue.update_candidates(&job.id, links.clone());
                job.candidate_links = links;
            }
            Ok(None) => {
                warn!(job_id = %job.id, "catalog has no details for job");
                self.queue
                    .record_error(&job.id, "catalog has no details for this book");
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "catalog lookup failed");
                self.queue.record_error(&job.id, e.to_string());
            }
        }
    }
}

impl std::fmt::Debug for DownloadWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadWorker")
            .field("has_catalog", &self.catalog.is_some())
            .field("preference", &self.preference)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobRunner for DownloadWorker {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn run(&self, mut job: Job) -> JobOutcome {
        if job.candidate_links.is_empty() {
            self.refresh_candidates(&mut job).await;
        }

        let progress = QueueProgress::new(Arc::clone(&self.queue), &job.id);
        let report = self.protocol.run(&job, &progress).await;

        match report.outcome {
            JobOutcome::Failed { reason } => {
                let reason = match report.failed_attempts.last() {
                    Some(last) => format!(
                        "{reason} ({} candidate(s) failed; last: {} {}: {})",
                        report.failed_attempts.len(),
                        last.stage,
                        last.link,
                        last.reason
                    ),
                    None if reason == NO_REACHABLE_SOURCE => {
                        format!("{reason} (no candidate links)")
                    }
                    None => reason,
                };
                JobOutcome::Failed { reason }
            }
            outcome => {
                if let Some(source) = &report.source_url {
                    debug!(source = %source, "job finished from source");
                }
                outcome
            }
        }
    }
}
