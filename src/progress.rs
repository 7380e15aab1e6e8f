//! Progress UI (spinner) for download runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bookdl_core::{JobQueue, JobStatus};
use indicatif::{ProgressBar, ProgressStyle};

const TICK: Duration = Duration::from_millis(120);

/// Spawns the spinner when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_spinner` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
    queue: Arc<JobQueue>,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_spinner_inner(queue, total, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_spinner_inner(
    queue: Arc<JobQueue>,
    total: usize,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            spinner.set_message(status_line(&queue, total));
            tokio::time::sleep(TICK).await;
        }

        spinner.finish_and_clear();
    })
}

pub(crate) fn status_line(queue: &JobQueue, total: usize) -> String {
    let done = queue.count_by_status(JobStatus::Available)
        + queue.count_by_status(JobStatus::Error)
        + queue.count_by_status(JobStatus::Cancelled);
    let queued = queue.count_by_status(JobStatus::Queued);
    let active = queue.get_active_ids();

    let current = active
        .first()
        .and_then(|id| queue.job(id))
        .map(|job| format!(" {} {:.0}%", job.record.display_title(), job.progress))
        .unwrap_or_default();

    format!(
        "[{}/{}] active {} queued {}{}",
        done.min(total),
        total,
        active.len(),
        queued,
        current
    )
}
