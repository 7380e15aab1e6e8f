//! In-memory job queue: the single authority on job status and priority.
//!
//! Every operation runs inside one critical section over the whole queue
//! state, so callers never observe a job in two states or a half-applied
//! batch. Nothing awaits while the lock is held.
//!
//! # Overview
//!
//! - [`JobQueue`] - registry of jobs with atomic mutations
//! - [`Job`] - snapshot of one job
//! - [`JobStatus`] - lifecycle states
//! - [`JobOutcome`] - worker result written back through [`JobQueue::finish`]
//! - [`QueueError`] - rejected mutations
//!
//! # Example
//!
//! ```
//! use bookdl_core::catalog::BookRecord;
//! use bookdl_core::queue::{JobQueue, JobStatus};
//!
//! let queue = JobQueue::new();
//! queue.add("b1", BookRecord::new("b1"), 5);
//! queue.add("b2", BookRecord::new("b2"), 1);
//!
//! let (id, _token) = queue.get_next().unwrap();
//! assert_eq!(id, "b2");
//! assert_eq!(queue.job("b2").unwrap().status, JobStatus::Downloading);
//! ```

mod error;
mod job;

pub use error::QueueError;
pub use job::{AddOutcome, Job, JobOutcome, JobStatus};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument};

use crate::cancel::CancellationToken;
use crate::catalog::BookRecord;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Grouped view returned by [`JobQueue::get_status_snapshot`].
pub type StatusSnapshot = BTreeMap<JobStatus, BTreeMap<String, Job>>;

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    next_seq: u64,
}

impl QueueState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn live_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs
            .get_mut(id)
            .filter(|job| !job.status.is_terminal())
    }
}

/// Thread-safe registry of jobs.
///
/// Shared as `Arc<JobQueue>` between the service, the coordinator and the
/// workers' progress sinks.
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
}

impl JobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a job or refreshes an existing one.
    ///
    /// Candidate links are taken from `record.download_urls` in the order
    /// given. A live job (queued or downloading) keeps its status and token;
    /// its metadata and priority are replaced, and its candidates are replaced
    /// when the new record carries any. A terminal job starts a new lifetime:
    /// fresh token, `Queued`, zero progress, cleared artifact and error, and a
    /// new insertion sequence.
    #[instrument(skip(self, record), fields(job_id = %id))]
    pub fn add(&self, id: &str, record: BookRecord, priority: i64) -> AddOutcome {
        let mut state = self.lock();
        let seq = state.take_seq();

        if let Some(job) = state.jobs.get_mut(id) {
            let links = record.download_urls.clone();
            job.record = record;
            job.priority = priority;

            if job.status.is_terminal() {
                job.candidate_links = links;
                job.status = JobStatus::Queued;
                job.progress = 0.0;
                job.artifact_path = None;
                job.last_error = None;
                job.token = CancellationToken::new();
                job.seq = seq;
                info!(priority, "job requeued");
                return AddOutcome::Requeued;
            }

            if !links.is_empty() {
                job.candidate_links = links;
            }
            debug!(priority, status = %job.status, "live job updated in place");
            return AddOutcome::Updated;
        }

        let job = Job {
            id: id.to_string(),
            candidate_links: record.download_urls.clone(),
            record,
            priority,
            status: JobStatus::Queued,
            progress: 0.0,
            artifact_path: None,
            last_error: None,
            token: CancellationToken::new(),
            seq,
        };
        state.jobs.insert(id.to_string(), job);
        info!(priority, "job queued");
        AddOutcome::Inserted
    }

    /// Claims the next queued job and marks it downloading.
    ///
    /// Lowest priority value wins; ties go to the earliest insertion.
    #[instrument(skip(self))]
    pub fn claim_next(&self) -> Option<Job> {
        let mut state = self.lock();
        let job = state
            .jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Queued)
            .min_by_key(|job| (job.priority, job.seq))?;
        job.status = JobStatus::Downloading;
        job.progress = 0.0;
        debug!(job_id = %job.id, priority = job.priority, "job claimed");
        Some(job.clone())
    }

    /// Claims the next queued job, returning its id and cancellation token.
    pub fn get_next(&self) -> Option<(String, CancellationToken)> {
        self.claim_next().map(|job| (job.id, job.token))
    }

    /// Changes the priority of a live job. Returns false for unknown or
    /// terminal jobs.
    #[instrument(skip(self))]
    pub fn set_priority(&self, id: &str, priority: i64) -> bool {
        let mut state = self.lock();
        match state.live_mut(id) {
            Some(job) => {
                job.priority = priority;
                true
            }
            None => false,
        }
    }

    /// Applies several priority changes as one batch.
    ///
    /// Unknown and terminal ids are skipped. Returns true when at least one
    /// entry was applied.
    #[instrument(skip(self, priorities), fields(entries = priorities.len()))]
    pub fn reorder_queue(&self, priorities: &HashMap<String, i64>) -> bool {
        let mut state = self.lock();
        let mut applied = 0usize;
        for (id, priority) in priorities {
            if let Some(job) = state.live_mut(id) {
                job.priority = *priority;
                applied += 1;
            }
        }
        debug!(applied, "reorder applied");
        applied > 0
    }

    /// Moves a job along a lifecycle edge.
    ///
    /// Dispatch (`Queued` to `Downloading`) is not available here; only
    /// [`JobQueue::claim_next`] starts a job, so the coordinator's worker
    /// slots stay the only way in.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::JobNotFound`] for unknown ids and
    /// [`QueueError::InvalidTransition`] for anything that is not a lifecycle
    /// edge, including dispatch.
    #[instrument(skip(self))]
    pub fn update_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(id))?;
        let is_dispatch = job.status == JobStatus::Queued && status == JobStatus::Downloading;
        if is_dispatch || !job.status.can_transition_to(status) {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: status,
            });
        }
        job.status = status;
        Ok(())
    }

    /// Records progress for a live job, clamped to `0..=100`.
    ///
    /// Returns false for unknown or terminal jobs and for NaN input.
    pub fn update_progress(&self, id: &str, percent: f64) -> bool {
        if percent.is_nan() {
            return false;
        }
        let mut state = self.lock();
        match state.live_mut(id) {
            Some(job) => {
                job.progress = percent.clamp(0.0, 100.0);
                true
            }
            None => false,
        }
    }

    /// Sets the artifact path of a downloading job. Write-once.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::JobNotFound`], [`QueueError::NotDownloading`] or
    /// [`QueueError::ArtifactAlreadySet`].
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn update_artifact_path(&self, id: &str, path: PathBuf) -> Result<()> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(id))?;
        if job.status != JobStatus::Downloading {
            return Err(QueueError::NotDownloading {
                id: id.to_string(),
                status: job.status,
            });
        }
        if job.artifact_path.is_some() {
            return Err(QueueError::ArtifactAlreadySet { id: id.to_string() });
        }
        job.artifact_path = Some(path);
        Ok(())
    }

    /// Replaces the candidate links of a live job.
    #[instrument(skip(self, links), fields(links = links.len()))]
    pub fn update_candidates(&self, id: &str, links: Vec<String>) -> bool {
        let mut state = self.lock();
        match state.live_mut(id) {
            Some(job) => {
                job.candidate_links = links;
                true
            }
            None => false,
        }
    }

    /// Stores a diagnostic message on any known job.
    pub fn record_error(&self, id: &str, message: impl Into<String>) -> bool {
        let mut state = self.lock();
        match state.jobs.get_mut(id) {
            Some(job) => {
                job.last_error = Some(message.into());
                true
            }
            None => false,
        }
    }

    /// Writes a worker's outcome back in one step.
    ///
    /// A signaled token forces `Cancelled` whatever the outcome says. Only an
    /// `Available` outcome on an unsignaled job stores the artifact path.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::JobNotFound`] for unknown ids and
    /// [`QueueError::NotDownloading`] if the job is not downloading.
    #[instrument(skip(self, outcome), fields(outcome = ?outcome.status()))]
    pub fn finish(&self, id: &str, outcome: JobOutcome) -> Result<JobStatus> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(id))?;
        if job.status != JobStatus::Downloading {
            return Err(QueueError::NotDownloading {
                id: id.to_string(),
                status: job.status,
            });
        }

        if job.token.is_signaled() {
            job.status = JobStatus::Cancelled;
            return Ok(JobStatus::Cancelled);
        }

        match outcome {
            JobOutcome::Available { path } => {
                job.artifact_path = Some(path);
                job.progress = 100.0;
                job.status = JobStatus::Available;
            }
            JobOutcome::Failed { reason } => {
                job.last_error = Some(reason);
                job.status = JobStatus::Error;
            }
            JobOutcome::Cancelled => {
                job.status = JobStatus::Cancelled;
            }
        }
        Ok(job.status)
    }

    /// Cancels a live job.
    ///
    /// A queued job becomes `Cancelled` immediately. A downloading job only has
    /// its token signaled; the coordinator records `Cancelled` once the worker
    /// stops. Returns false for unknown or terminal jobs.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(job) = state.live_mut(id) else {
            return false;
        };
        job.token.signal();
        if job.status == JobStatus::Queued {
            job.status = JobStatus::Cancelled;
            info!("queued job cancelled");
        } else {
            info!("cancellation signaled to running job");
        }
        true
    }

    /// Cancels every live job. Returns the ids that were signaled.
    pub fn cancel_all(&self) -> Vec<String> {
        let ids: Vec<String> = {
            let state = self.lock();
            state
                .jobs
                .values()
                .filter(|job| !job.status.is_terminal())
                .map(|job| job.id.clone())
                .collect()
        };
        ids.into_iter().filter(|id| self.cancel(id)).collect()
    }

    /// Copies every job, grouped by status. All statuses are present as keys.
    #[must_use]
    pub fn get_status_snapshot(&self) -> StatusSnapshot {
        let state = self.lock();
        let mut snapshot: StatusSnapshot = JobStatus::ALL
            .iter()
            .map(|status| (*status, BTreeMap::new()))
            .collect();
        for job in state.jobs.values() {
            snapshot
                .entry(job.status)
                .or_default()
                .insert(job.id.clone(), job.clone());
        }
        snapshot
    }

    /// Ids of downloading jobs, in claim order.
    #[must_use]
    pub fn get_active_ids(&self) -> Vec<String> {
        let state = self.lock();
        let mut active: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Downloading)
            .collect();
        active.sort_by_key(|job| job.seq);
        active.into_iter().map(|job| job.id.clone()).collect()
    }

    /// Ids of queued jobs in the order they will be dispatched.
    #[must_use]
    pub fn get_queue_order(&self) -> Vec<String> {
        let state = self.lock();
        let mut queued: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .collect();
        queued.sort_by_key(|job| (job.priority, job.seq));
        queued.into_iter().map(|job| job.id.clone()).collect()
    }

    /// Removes all terminal jobs. Returns how many were removed.
    #[instrument(skip(self))]
    pub fn clear_completed(&self) -> usize {
        let mut state = self.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, job| !job.status.is_terminal());
        let removed = before - state.jobs.len();
        if removed > 0 {
            info!(removed, "terminal jobs cleared");
        }
        removed
    }

    /// Copy of a single job.
    #[must_use]
    pub fn job(&self, id: &str) -> Option<Job> {
        self.lock().jobs.get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    #[must_use]
    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .count()
    }

    /// True when no job is queued or downloading.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.lock()
            .jobs
            .values()
            .all(|job| job.status.is_terminal())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(id: &str) -> BookRecord {
        BookRecord::new(id).with_links([format!("https://mirror.example/{id}.epub")])
    }

    fn queue_with(ids: &[(&str, i64)]) -> JobQueue {
        let queue = JobQueue::new();
        for (id, priority) in ids {
            queue.add(id, record(id), *priority);
        }
        queue
    }

    #[test]
    fn test_add_inserts_queued_job() {
        let queue = JobQueue::new();
        assert_eq!(queue.add("a", record("a"), 0), AddOutcome::Inserted);
        let job = queue.job("a").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.candidate_links, record("a").download_urls);
        assert!(!job.token.is_signaled());
    }

    #[test]
    fn test_get_next_orders_by_priority_then_insertion() {
        let queue = queue_with(&[("a", 2), ("b", 1), ("c", 1)]);
        assert_eq!(queue.get_next().unwrap().0, "b");
        assert_eq!(queue.get_next().unwrap().0, "c");
        assert_eq!(queue.get_next().unwrap().0, "a");
        assert!(queue.get_next().is_none());
    }

    #[test]
    fn test_get_next_marks_downloading() {
        let queue = queue_with(&[("a", 0)]);
        let (id, token) = queue.get_next().unwrap();
        assert_eq!(queue.job(&id).unwrap().status, JobStatus::Downloading);
        assert!(!token.is_signaled());
    }

    #[test]
    fn test_reorder_queue_changes_dispatch_order() {
        let queue = queue_with(&[("A", 0), ("B", 0), ("C", 0)]);
        let batch = HashMap::from([
            ("A".to_string(), 5),
            ("B".to_string(), 1),
            ("C".to_string(), 3),
        ]);
        assert!(queue.reorder_queue(&batch));
        assert_eq!(queue.get_queue_order(), vec!["B", "C", "A"]);
    }

    #[test]
    fn test_reorder_queue_skips_unknown_and_terminal() {
        let queue = queue_with(&[("A", 0)]);
        queue.cancel("A");
        let batch = HashMap::from([("A".to_string(), 5), ("Z".to_string(), 1)]);
        assert!(!queue.reorder_queue(&batch));
        assert_eq!(queue.job("A").unwrap().priority, 0);
    }

    #[test]
    fn test_set_priority_rejects_terminal() {
        let queue = queue_with(&[("a", 0)]);
        assert!(queue.set_priority("a", 9));
        queue.cancel("a");
        assert!(!queue.set_priority("a", 1));
        assert!(!queue.set_priority("missing", 1));
    }

    // ==================== Cancellation Tests ====================

    #[test]
    fn test_cancel_queued_goes_straight_to_cancelled() {
        let queue = queue_with(&[("a", 0)]);
        assert!(queue.cancel("a"));
        let job = queue.job("a").unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.token.is_signaled());
        assert!(queue.get_next().is_none(), "cancelled job must not dispatch");
    }

    #[test]
    fn test_cancel_downloading_only_signals() {
        let queue = queue_with(&[("a", 0)]);
        let (_, token) = queue.get_next().unwrap();
        assert!(queue.cancel("a"));
        assert!(token.is_signaled());
        assert_eq!(queue.job("a").unwrap().status, JobStatus::Downloading);
    }

    #[test]
    fn test_cancel_terminal_or_unknown_returns_false() {
        let queue = queue_with(&[("a", 0)]);
        queue.cancel("a");
        assert!(!queue.cancel("a"));
        assert!(!queue.cancel("nope"));
    }

    #[test]
    fn test_cancel_all_signals_live_jobs() {
        let queue = queue_with(&[("a", 0), ("b", 0)]);
        queue.get_next();
        let mut cancelled = queue.cancel_all();
        cancelled.sort();
        assert_eq!(cancelled, vec!["a", "b"]);
    }

    // ==================== Status Transition Tests ====================

    #[test]
    fn test_update_status_rejects_illegal_edges() {
        let queue = queue_with(&[("a", 0)]);
        let err = queue.update_status("a", JobStatus::Available).unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        queue.claim_next().unwrap();
        queue.update_status("a", JobStatus::Error).unwrap();
        assert!(queue.update_status("a", JobStatus::Queued).is_err());
    }

    #[test]
    fn test_update_status_cannot_dispatch() {
        let queue = queue_with(&[("a", 0), ("b", 1)]);
        let err = queue.update_status("a", JobStatus::Downloading).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Downloading,
                ..
            }
        ));
        assert!(queue.get_active_ids().is_empty());
        assert_eq!(queue.claim_next().unwrap().id, "a");
    }

    #[test]
    fn test_update_status_unknown_job() {
        let queue = JobQueue::new();
        assert_eq!(
            queue.update_status("x", JobStatus::Downloading),
            Err(QueueError::not_found("x"))
        );
    }

    #[test]
    fn test_update_progress_clamps() {
        let queue = queue_with(&[("a", 0)]);
        queue.get_next();
        assert!(queue.update_progress("a", 150.0));
        assert!((queue.job("a").unwrap().progress - 100.0).abs() < f64::EPSILON);
        assert!(queue.update_progress("a", -3.0));
        assert!(queue.job("a").unwrap().progress.abs() < f64::EPSILON);
        assert!(!queue.update_progress("a", f64::NAN));
    }

    #[test]
    fn test_update_artifact_path_is_write_once() {
        let queue = queue_with(&[("a", 0)]);
        let err = queue
            .update_artifact_path("a", PathBuf::from("/x/a.epub"))
            .unwrap_err();
        assert!(matches!(err, QueueError::NotDownloading { .. }));

        queue.get_next();
        queue
            .update_artifact_path("a", PathBuf::from("/x/a.epub"))
            .unwrap();
        assert_eq!(
            queue.update_artifact_path("a", PathBuf::from("/x/b.epub")),
            Err(QueueError::ArtifactAlreadySet { id: "a".into() })
        );
    }

    #[test]
    fn test_update_candidates_only_while_live() {
        let queue = queue_with(&[("a", 0)]);
        assert!(queue.update_candidates("a", vec!["https://x/1".into()]));
        queue.cancel("a");
        assert!(!queue.update_candidates("a", vec![]));
        assert_eq!(queue.job("a").unwrap().candidate_links, vec!["https://x/1"]);
    }

    // ==================== Finish Tests ====================

    #[test]
    fn test_finish_available_sets_path() {
        let queue = queue_with(&[("a", 0)]);
        queue.get_next();
        let status = queue
            .finish(
                "a",
                JobOutcome::Available {
                    path: PathBuf::from("/out/a.epub"),
                },
            )
            .unwrap();
        assert_eq!(status, JobStatus::Available);
        let job = queue.job("a").unwrap();
        assert_eq!(job.artifact_path, Some(PathBuf::from("/out/a.epub")));
        assert!((job.progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_finish_prefers_cancelled_when_signaled() {
        let queue = queue_with(&[("a", 0)]);
        queue.get_next();
        queue.cancel("a");
        let status = queue
            .finish(
                "a",
                JobOutcome::Failed {
                    reason: "boom".into(),
                },
            )
            .unwrap();
        assert_eq!(status, JobStatus::Cancelled);
        assert!(queue.job("a").unwrap().last_error.is_none());
    }

    #[test]
    fn test_finish_requires_downloading() {
        let queue = queue_with(&[("a", 0)]);
        assert!(matches!(
            queue.finish("a", JobOutcome::Cancelled),
            Err(QueueError::NotDownloading { .. })
        ));
    }

    // ==================== Re-add Tests ====================

    #[test]
    fn test_readd_downloading_job_updates_in_place() {
        let queue = queue_with(&[("a", 5)]);
        let (_, token) = queue.get_next().unwrap();

        let mut updated = record("a");
        updated.title = Some("New title".into());
        assert_eq!(queue.add("a", updated, 1), AddOutcome::Updated);

        let job = queue.job("a").unwrap();
        assert_eq!(job.status, JobStatus::Downloading);
        assert_eq!(job.priority, 1);
        assert_eq!(job.record.title.as_deref(), Some("New title"));
        token.signal();
        assert!(job.token.is_signaled(), "token must be preserved");
    }

    #[test]
    fn test_readd_without_links_keeps_candidates() {
        let queue = queue_with(&[("a", 0)]);
        assert_eq!(queue.add("a", BookRecord::new("a"), 0), AddOutcome::Updated);
        assert_eq!(queue.job("a").unwrap().candidate_links.len(), 1);
    }

    #[test]
    fn test_readd_terminal_job_starts_new_lifetime() {
        let queue = queue_with(&[("a", 0), ("b", 0)]);
        queue.cancel("a");
        let old_token = queue.job("a").unwrap().token;

        assert_eq!(queue.add("a", record("a"), 0), AddOutcome::Requeued);
        let job = queue.job("a").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(old_token.is_signaled());
        assert!(!job.token.is_signaled());
        assert_eq!(queue.get_queue_order(), vec!["b", "a"]);
    }

    // ==================== Snapshot Tests ====================

    #[test]
    fn test_snapshot_groups_every_status() {
        let queue = queue_with(&[("a", 0), ("b", 0), ("c", 0)]);
        queue.get_next();
        queue.cancel("c");

        let snapshot = queue.get_status_snapshot();
        assert_eq!(snapshot.len(), JobStatus::ALL.len());
        assert!(snapshot[&JobStatus::Downloading].contains_key("a"));
        assert!(snapshot[&JobStatus::Queued].contains_key("b"));
        assert!(snapshot[&JobStatus::Cancelled].contains_key("c"));
        let total: usize = snapshot.values().map(BTreeMap::len).sum();
        assert_eq!(total, 3, "each job appears in exactly one group");
    }

    #[test]
    fn test_clear_completed_removes_only_terminal() {
        let queue = queue_with(&[("a", 0), ("b", 0), ("c", 0), ("d", 0)]);
        queue.get_next(); // a downloading
        queue.get_next(); // b downloading
        queue
            .finish(
                "b",
                JobOutcome::Failed {
                    reason: "no reachable source".into(),
                },
            )
            .unwrap();
        queue.cancel("c");

        assert_eq!(queue.clear_completed(), 2);
        assert_eq!(queue.len(), 2);
        assert!(queue.job("a").is_some());
        assert!(queue.job("d").is_some());
    }

    #[test]
    fn test_is_settled() {
        let queue = queue_with(&[("a", 0)]);
        assert!(!queue.is_settled());
        queue.cancel("a");
        assert!(queue.is_settled());
        assert!(JobQueue::new().is_settled());
    }
}
