//! The download service: one object wiring catalog, queue and coordinator.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{BookRecord, Catalog, CatalogError, SearchFilters, SourcePreference};
use crate::config::Settings;
use crate::coordinator::{CoordinatorError, CoordinatorHandle, WorkerCoordinator};
use crate::queue::{AddOutcome, JobQueue, JobStatus, StatusSnapshot};
use crate::worker::{DownloadWorker, JobRunner, WorkerBuildError};

/// Errors surfaced by [`DownloadService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no job with id '{id}'")]
    NotFound { id: String },

    #[error("job '{id}' is not available yet (status: {status})")]
    NotReady { id: String, status: JobStatus },

    #[error(
        "artifact for job '{id}' is missing from disk\n  Suggestion: re-add the job to download it again"
    )]
    Gone { id: String, path: Option<PathBuf> },

    #[error("failed to read artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to set up download worker: {source}")]
    Worker {
        #[source]
        source: WorkerBuildError,
    },

    #[error("failed to start coordinator: {source}")]
    Coordinator {
        #[source]
        source: CoordinatorError,
    },
}

/// Entry point for callers: enqueue, steer, observe and collect downloads.
pub struct DownloadService {
    queue: Arc<JobQueue>,
    catalog: Arc<dyn Catalog>,
    preference: SourcePreference,
}

impl std::fmt::Debug for DownloadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadService")
            .field("jobs", &self.queue.len())
            .field("preference", &self.preference)
            .finish_non_exhaustive()
    }
}

impl DownloadService {
    #[must_use]
    pub fn new(queue: Arc<JobQueue>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            queue,
            catalog,
            preference: SourcePreference::default(),
        }
    }

    /// Link ordering applied at enqueue time.
    #[must_use]
    pub fn with_preference(mut self, preference: SourcePreference) -> Self {
        self.preference = preference;
        self
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Looks `id` up in the catalog and enqueues it.
    ///
    /// Returns false when the catalog does not know the id or fails.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, id: &str, priority: i64) -> bool {
        match self.catalog.get_details(id).await {
            Ok(Some(record)) => self.enqueue_record(record, priority),
            Ok(None) => {
                warn!(id, "catalog has no such book");
                false
            }
            Err(e) => {
                warn!(id, error = %e, "catalog lookup failed");
                false
            }
        }
    }

    /// Enqueues a record directly, ordering its links by preference.
    ///
    /// Returns false for a blank id.
    #[instrument(skip(self, record), fields(id = %record.id))]
    pub fn enqueue_record(&self, mut record: BookRecord, priority: i64) -> bool {
        let id = record.id.trim().to_string();
        if id.is_empty() {
            warn!("refusing record with empty id");
            return false;
        }
        record.download_urls = self.preference.order(&record.download_urls);
        let outcome = self.queue.add(&id, record, priority);
        match outcome {
            AddOutcome::Inserted => info!(id, priority, "job queued"),
            AddOutcome::Updated => debug!(id, priority, "live job updated"),
            AddOutcome::Requeued => info!(id, priority, "finished job queued again"),
        }
        true
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.queue.cancel(id)
    }

    pub fn set_priority(&self, id: &str, priority: i64) -> bool {
        self.queue.set_priority(id, priority)
    }

    pub fn bulk_reorder(&self, priorities: &HashMap<String, i64>) -> bool {
        self.queue.reorder_queue(priorities)
    }

    /// Grouped snapshot; artifact paths no longer on disk read as `None`.
    #[must_use]
    pub fn query_status(&self) -> StatusSnapshot {
        let mut snapshot = self.queue.get_status_snapshot();
        for job in snapshot.values_mut().flat_map(|jobs| jobs.values_mut()) {
            if job.artifact_path.as_ref().is_some_and(|p| !p.exists()) {
                job.artifact_path = None;
            }
        }
        snapshot
    }

    #[must_use]
    pub fn list_active(&self) -> Vec<String> {
        self.queue.get_active_ids()
    }

    #[must_use]
    pub fn list_queue_order(&self) -> Vec<String> {
        self.queue.get_queue_order()
    }

    pub fn purge_completed(&self) -> usize {
        self.queue.clear_completed()
    }

    /// Reads a delivered artifact back.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::NotFound`] for an unknown id
    /// - [`ServiceError::NotReady`] unless the job is available
    /// - [`ServiceError::Gone`] when the file has disappeared
    /// - [`ServiceError::Io`] on any other read failure
    pub async fn fetch_result(&self, id: &str) -> Result<(Vec<u8>, BookRecord), ServiceError> {
        let job = self.queue.job(id).ok_or_else(|| ServiceError::NotFound {
            id: id.to_string(),
        })?;
        if job.status != JobStatus::Available {
            return Err(ServiceError::NotReady {
                id: id.to_string(),
                status: job.status,
            });
        }
        let Some(path) = job.artifact_path else {
            return Err(ServiceError::Gone {
                id: id.to_string(),
                path: None,
            });
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok((bytes, job.record)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ServiceError::Gone {
                id: id.to_string(),
                path: Some(path),
            }),
            Err(source) => Err(ServiceError::Io { path, source }),
        }
    }

    /// Catalog search passthrough.
    ///
    /// # Errors
    ///
    /// Propagates the catalog's error.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<BookRecord>, CatalogError> {
        self.catalog.lookup_sources(query, filters).await
    }

    /// Catalog details passthrough.
    ///
    /// # Errors
    ///
    /// Propagates the catalog's error.
    pub async fn details(&self, id: &str) -> Result<Option<BookRecord>, CatalogError> {
        self.catalog.get_details(id).await
    }

    /// Starts a coordinator over this service's queue with a custom runner.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Coordinator`] for an invalid worker count.
    pub fn start(
        &self,
        runner: Arc<dyn JobRunner>,
        max_workers: usize,
        poll_interval: Duration,
    ) -> Result<CoordinatorHandle, ServiceError> {
        let coordinator =
            WorkerCoordinator::new(Arc::clone(&self.queue), runner, max_workers, poll_interval)
                .map_err(|source| ServiceError::Coordinator { source })?;
        Ok(coordinator.spawn())
    }

    /// Starts a coordinator running the default download worker.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Worker`] if the HTTP stack cannot be built and
    /// [`ServiceError::Coordinator`] for an invalid worker count.
    pub fn start_with_settings(&self, settings: &Settings) -> Result<CoordinatorHandle, ServiceError> {
        let worker = DownloadWorker::from_settings(
            Arc::clone(&self.queue),
            Some(Arc::clone(&self.catalog)),
            settings,
        )
        .map_err(|source| ServiceError::Worker { source })?;
        self.start(
            Arc::new(worker),
            settings.max_concurrent_downloads,
            settings.poll_interval(),
        )
    }

    /// Resolves once no job is queued or downloading.
    pub async fn wait_until_settled(&self, poll_interval: Duration) {
        while !self.queue.is_settled() {
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::queue::JobOutcome;

    fn service() -> DownloadService {
        let catalog = StaticCatalog::from_records(vec![
            BookRecord::new("abc").with_links([
                "https://z-lib.gs/md5/abc",
                "https://libgen.li/ads.php?md5=abc",
                "https://z-lib.gs/md5/abc",
            ]),
        ]);
        DownloadService::new(Arc::new(JobQueue::new()), Arc::new(catalog))
    }

    #[tokio::test]
    async fn test_enqueue_orders_links() {
        let service = service();
        assert!(service.enqueue("abc", 0).await);
        let job = service.queue().job("abc").unwrap();
        assert_eq!(
            job.candidate_links,
            vec![
                "https://libgen.li/ads.php?md5=abc".to_string(),
                "https://z-lib.gs/md5/abc".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_enqueue_unknown_is_false() {
        assert!(!service().enqueue("missing", 0).await);
    }

    #[test]
    fn test_enqueue_record_rejects_blank_id() {
        assert!(!service().enqueue_record(BookRecord::new("  "), 0));
    }

    #[tokio::test]
    async fn test_fetch_result_errors() {
        let service = service();
        assert!(matches!(
            service.fetch_result("nope").await.unwrap_err(),
            ServiceError::NotFound { .. }
        ));
        service.enqueue("abc", 0).await;
        assert!(matches!(
            service.fetch_result("abc").await.unwrap_err(),
            ServiceError::NotReady {
                status: JobStatus::Queued,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_result_gone_and_hidden_in_status() {
        let service = service();
        service.enqueue("abc", 0).await;
        service.queue().get_next().unwrap();
        let missing = std::env::temp_dir().join("bookdl-missing-artifact.epub");
        service
            .queue()
            .finish("abc", JobOutcome::Available { path: missing })
            .unwrap();

        assert!(matches!(
            service.fetch_result("abc").await.unwrap_err(),
            ServiceError::Gone { .. }
        ));
        let snapshot = service.query_status();
        assert!(snapshot[&JobStatus::Available]["abc"].artifact_path.is_none());
    }

    #[tokio::test]
    async fn test_fetch_result_reads_artifact() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("abc.epub");
        std::fs::write(&path, b"book").unwrap();

        let service = service();
        service.enqueue("abc", 0).await;
        service.queue().get_next().unwrap();
        service
            .queue()
            .finish("abc", JobOutcome::Available { path })
            .unwrap();

        let (bytes, record) = service.fetch_result("abc").await.unwrap();
        assert_eq!(bytes, b"book");
        assert_eq!(record.id, "abc");
    }

    #[tokio::test]
    async fn test_search_passthrough() {
        let found = service()
            .search("abc", &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
