//! Polling supervisor that keeps up to N jobs running.
//!
//! Each cycle the coordinator reaps finished workers and writes their
//! outcome back through [`JobQueue::finish`], fills free slots from the
//! queue, then sleeps for the poll interval (or until shutdown). It never
//! awaits a worker's I/O, and a crashing worker only ever costs its own job.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bookdl_core::coordinator::WorkerCoordinator;
//! use bookdl_core::queue::JobQueue;
//! use bookdl_core::worker::DownloadWorker;
//! use bookdl_core::config::Settings;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(JobQueue::new());
//! let worker = DownloadWorker::from_settings(Arc::clone(&queue), None, &Settings::default())?;
//! let handle = WorkerCoordinator::new(Arc::clone(&queue), Arc::new(worker), 3, Duration::from_millis(250))?
//!     .spawn();
//! // ... enqueue work, wait ...
//! let stats = handle.shutdown().await?;
//! println!("available: {}, failed: {}", stats.completed, stats.failed);
//! # Ok(())
//! # }
//! ```

mod pool;

pub use pool::{Reaped, WorkerPool};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::queue::{JobOutcome, JobQueue, JobStatus};
use crate::worker::JobRunner;

/// Minimum allowed number of concurrent workers.
pub const MIN_WORKERS: usize = 1;

/// Maximum allowed number of concurrent workers.
pub const MAX_WORKERS: usize = 100;

/// Errors from building or stopping the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(
        "invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}\n  Suggestion: pass a concurrency within range"
    )]
    InvalidConcurrency { value: usize },

    #[error("worker pool is closed, job '{job_id}' was not started")]
    PoolClosed { job_id: String },

    #[error("coordinator task failed: {reason}")]
    Join { reason: String },
}

/// Totals over one coordinator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl CoordinatorStats {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Available => self.completed += 1,
            JobStatus::Error => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Queued | JobStatus::Downloading => {}
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Dispatches queued jobs to a [`JobRunner`] with bounded concurrency.
pub struct WorkerCoordinator {
    queue: Arc<JobQueue>,
    runner: Arc<dyn JobRunner>,
    max_workers: usize,
    poll_interval: Duration,
}

impl std::fmt::Debug for WorkerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCoordinator")
            .field("max_workers", &self.max_workers)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl WorkerCoordinator {
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidConcurrency`] unless
    /// `max_workers` is within `1..=100`.
    #[instrument(level = "debug", skip(queue, runner))]
    pub fn new(
        queue: Arc<JobQueue>,
        runner: Arc<dyn JobRunner>,
        max_workers: usize,
        poll_interval: Duration,
    ) -> Result<Self, CoordinatorError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&max_workers) {
            return Err(CoordinatorError::InvalidConcurrency { value: max_workers });
        }
        Ok(Self {
            queue,
            runner,
            max_workers,
            poll_interval,
        })
    }

    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Starts the supervisory loop on the runtime.
    #[must_use]
    pub fn spawn(self) -> CoordinatorHandle {
        let shutdown = CancellationToken::new();
        let queue = Arc::clone(&self.queue);
        let loop_shutdown = shutdown.clone();
        let join = tokio::spawn(async move { self.run(loop_shutdown).await });
        CoordinatorHandle {
            queue,
            shutdown,
            join,
        }
    }

    #[instrument(skip_all, fields(max_workers = self.max_workers))]
    async fn run(self, shutdown: CancellationToken) -> CoordinatorStats {
        let mut pool = WorkerPool::new();
        let mut stats = CoordinatorStats::default();
        info!("coordinator started");

        loop {
            while let Some((job_id, outcome)) = pool.try_reap() {
                self.finalize(&job_id, outcome, &mut stats).await;
            }

            while pool.len() < self.max_workers {
                let Some(job) = self.queue.claim_next() else {
                    break;
                };
                debug!(job_id = %job.id, priority = job.priority, "dispatching job");
                let job_id = job.id.clone();
                if let Err(e) = pool.submit(job, Arc::clone(&self.runner)) {
                    warn!(job_id = %job_id, error = %e, "could not start worker");
                    self.finalize(&job_id, JobOutcome::Failed { reason: e.to_string() }, &mut stats)
                        .await;
                }
            }

            tokio::select! {
                biased;
                () = shutdown.signaled() => break,
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        pool.close();
        debug!(in_flight = pool.len(), "draining workers");
        for (job_id, outcome) in pool.drain().await {
            self.finalize(&job_id, outcome, &mut stats).await;
        }
        info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "coordinator stopped"
        );
        stats
    }

    /// Writes an outcome back; a cancelled job never keeps its artifact.
    async fn finalize(&self, job_id: &str, outcome: JobOutcome, stats: &mut CoordinatorStats) {
        let delivered = match &outcome {
            JobOutcome::Available { path } => Some(path.clone()),
            _ => None,
        };
        match self.queue.finish(job_id, outcome) {
            Ok(status) => {
                info!(job_id, status = %status, "job finished");
                stats.record(status);
                if status == JobStatus::Cancelled
                    && let Some(path) = delivered
                {
                    debug!(job_id, path = %path.display(), "removing artifact of cancelled job");
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(job_id, path = %path.display(), error = %e, "failed to remove artifact");
                    }
                }
            }
            Err(e) => warn!(job_id, error = %e, "failed to record job outcome"),
        }
    }
}

/// Control handle for a spawned coordinator.
#[derive(Debug)]
pub struct CoordinatorHandle {
    queue: Arc<JobQueue>,
    shutdown: CancellationToken,
    join: JoinHandle<CoordinatorStats>,
}

impl CoordinatorHandle {
    /// Stops dispatching, waits for in-flight workers and records their
    /// outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Join`] if the coordinator task itself
    /// panicked.
    pub async fn shutdown(self) -> Result<CoordinatorStats, CoordinatorError> {
        self.shutdown.signal();
        self.join.await.map_err(|e| CoordinatorError::Join {
            reason: e.to_string(),
        })
    }

    /// Cancels every live job, then shuts down.
    ///
    /// # Errors
    ///
    /// See [`CoordinatorHandle::shutdown`].
    pub async fn shutdown_and_cancel(self) -> Result<CoordinatorStats, CoordinatorError> {
        let cancelled = self.queue.cancel_all();
        info!(count = cancelled.len(), "cancelled live jobs for shutdown");
        self.shutdown().await
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::catalog::BookRecord;
    use crate::queue::Job;

    struct AlwaysFails;

    #[async_trait]
    impl JobRunner for AlwaysFails {
        async fn run(&self, job: Job) -> JobOutcome {
            JobOutcome::Failed {
                reason: format!("nothing for {}", job.id),
            }
        }
    }

    #[test]
    fn test_rejects_invalid_concurrency() {
        let queue = Arc::new(JobQueue::new());
        for value in [0, 101] {
            let err = WorkerCoordinator::new(
                Arc::clone(&queue),
                Arc::new(AlwaysFails),
                value,
                Duration::from_millis(10),
            )
            .unwrap_err();
            assert!(matches!(err, CoordinatorError::InvalidConcurrency { .. }));
        }
    }

    #[test]
    fn test_stats_record() {
        let mut stats = CoordinatorStats::default();
        stats.record(JobStatus::Available);
        stats.record(JobStatus::Error);
        stats.record(JobStatus::Cancelled);
        stats.record(JobStatus::Queued);
        assert_eq!(stats.total(), 3);
    }

    #[tokio::test]
    async fn test_runs_queue_to_settled() {
        let queue = Arc::new(JobQueue::new());
        queue.add("a", BookRecord::new("a"), 0);
        queue.add("b", BookRecord::new("b"), 1);
        let handle = WorkerCoordinator::new(
            Arc::clone(&queue),
            Arc::new(AlwaysFails),
            1,
            Duration::from_millis(5),
        )
        .unwrap()
        .spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_settled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.failed, 2);
        assert_eq!(queue.count_by_status(JobStatus::Error), 2);
        assert_eq!(
            queue.job("a").unwrap().last_error.as_deref(),
            Some("nothing for a")
        );
    }
}
