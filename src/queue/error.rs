//! Error types for queue operations.

use thiserror::Error;

use super::JobStatus;

/// Errors returned by [`JobQueue`](super::JobQueue) mutations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// No job with this id exists.
    #[error("job not found: {id}")]
    JobNotFound { id: String },

    /// The requested status change is not a lifecycle edge.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// The operation is only legal while the job is downloading.
    #[error("job {id} is {status}, expected downloading")]
    NotDownloading { id: String, status: JobStatus },

    /// The artifact path is write-once per job lifetime.
    #[error(
        "artifact path already set for job {id}\n  Suggestion: re-add the job to start a new lifetime"
    )]
    ArtifactAlreadySet { id: String },
}

impl QueueError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::JobNotFound { id: id.into() }
    }
}
