//! Job and status definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::catalog::BookRecord;

/// Lifecycle state of a job.
///
/// ```text
/// Queued -> Downloading -> Available | Error | Cancelled
/// Queued -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot.
    Queued,
    /// Executing the failover protocol.
    Downloading,
    /// Artifact delivered.
    Available,
    /// Every candidate failed.
    Error,
    /// Cancelled by the caller.
    Cancelled,
}

impl JobStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Downloading,
        Self::Available,
        Self::Error,
        Self::Cancelled,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Available => "available",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses accept no further transitions.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Available | Self::Error | Self::Cancelled)
    }

    /// Returns true when `self -> next` is a legal lifecycle edge.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Downloading | Self::Cancelled)
                | (
                    Self::Downloading,
                    Self::Available | Self::Error | Self::Cancelled
                )
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "available" => Ok(Self::Available),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid job status: {s}")),
        }
    }
}

/// Snapshot of one job as held by the queue.
#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque identifier, unique within the queue.
    pub id: String,
    /// Display metadata.
    pub record: BookRecord,
    /// Candidate links in the order they will be tried.
    pub candidate_links: Vec<String>,
    /// Lower values are served first.
    pub priority: i64,
    pub status: JobStatus,
    /// Percent complete in `0.0..=100.0`.
    pub progress: f64,
    /// Delivered file, set once the job is available.
    pub artifact_path: Option<PathBuf>,
    /// Most recent diagnostic.
    pub last_error: Option<String>,
    /// Cancellation signal for this job lifetime.
    pub token: CancellationToken,
    /// Insertion order, used to break priority ties.
    pub seq: u64,
}

/// Result of running a job, written back by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// A candidate succeeded and the artifact was delivered.
    Available { path: PathBuf },
    /// No candidate produced a verified artifact.
    Failed { reason: String },
    /// Cancellation was observed.
    Cancelled,
}

impl JobOutcome {
    /// Status this outcome maps to when the token was not signaled.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Available { .. } => JobStatus::Available,
            Self::Failed { .. } => JobStatus::Error,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// What [`JobQueue::add`](super::JobQueue::add) did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new job was created.
    Inserted,
    /// A live job was updated in place; its status is unchanged.
    Updated,
    /// A terminal job was reset to `Queued` with a fresh token.
    Requeued,
}
