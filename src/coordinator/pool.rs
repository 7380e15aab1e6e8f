//! Structured ownership of in-flight worker tasks.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, warn};

use super::CoordinatorError;
use crate::queue::{Job, JobOutcome};
use crate::worker::JobRunner;

/// A finished worker: the job it ran and what came of it.
pub type Reaped = (String, JobOutcome);

/// Owns every spawned worker in a [`JoinSet`].
///
/// A panicking runner is caught inside its task and reported as
/// [`JobOutcome::Failed`], so the pool never loses track of a job.
#[derive(Debug, Default)]
pub struct WorkerPool {
    tasks: JoinSet<Reaped>,
    in_flight: HashMap<Id, String>,
    closed: bool,
}

impl WorkerPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `runner` on `job`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::PoolClosed`] after [`WorkerPool::close`].
    pub fn submit(&mut self, job: Job, runner: Arc<dyn JobRunner>) -> Result<(), CoordinatorError> {
        if self.closed {
            return Err(CoordinatorError::PoolClosed { job_id: job.id });
        }
        let job_id = job.id.clone();
        let task_job_id = job.id.clone();
        let handle = self.tasks.spawn(async move {
            let outcome = match AssertUnwindSafe(runner.run(job)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(job_id = %task_job_id, panic = %message, "worker panicked");
                    JobOutcome::Failed {
                        reason: format!("worker panicked: {message}"),
                    }
                }
            };
            (task_job_id, outcome)
        });
        debug!(job_id = %job_id, in_flight = self.tasks.len(), "worker submitted");
        self.in_flight.insert(handle.id(), job_id);
        Ok(())
    }

    /// Collects one finished worker without waiting.
    pub fn try_reap(&mut self) -> Option<Reaped> {
        let result = self.tasks.try_join_next_with_id()?;
        Some(self.settle(result))
    }

    /// Waits for every remaining worker.
    pub async fn drain(&mut self) -> Vec<Reaped> {
        let mut reaped = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.tasks.join_next_with_id().await {
            reaped.push(self.settle(result));
        }
        reaped
    }

    /// Refuses further submissions.
    pub fn close(&mut self) {
        self.closed = true;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Workers spawned and not yet reaped, finished or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn settle(&mut self, result: Result<(Id, Reaped), JoinError>) -> Reaped {
        match result {
            Ok((id, reaped)) => {
                self.in_flight.remove(&id);
                reaped
            }
            Err(join_error) => {
                let job_id = self
                    .in_flight
                    .remove(&join_error.id())
                    .unwrap_or_default();
                warn!(job_id = %job_id, error = %join_error, "worker task did not complete");
                let reason = if join_error.is_cancelled() {
                    "worker task aborted".to_string()
                } else {
                    format!("worker task failed: {join_error}")
                };
                (job_id, JobOutcome::Failed { reason })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
