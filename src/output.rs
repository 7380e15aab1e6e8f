//! End-of-run summary output.

use std::fmt::Write as _;

use bookdl_core::JobStatus;
use bookdl_core::queue::StatusSnapshot;

/// Renders per-status counts, delivered paths and failure reasons.
pub(crate) fn render_summary(snapshot: &StatusSnapshot) -> String {
    let mut out = String::new();
    let counts: Vec<String> = snapshot
        .iter()
        .filter(|(_, jobs)| !jobs.is_empty())
        .map(|(status, jobs)| format!("{status}: {}", jobs.len()))
        .collect();
    if counts.is_empty() {
        out.push_str("No jobs were run.\n");
        return out;
    }
    let _ = writeln!(out, "Summary: {}", counts.join(", "));

    if let Some(available) = snapshot.get(&JobStatus::Available) {
        for job in available.values() {
            match &job.artifact_path {
                Some(path) => {
                    let _ = writeln!(out, "  ok     {} -> {}", job.record.display_title(), path.display());
                }
                None => {
                    let _ = writeln!(out, "  ok     {} (file missing)", job.record.display_title());
                }
            }
        }
    }
    if let Some(failed) = snapshot.get(&JobStatus::Error) {
        for job in failed.values() {
            let reason = job.last_error.as_deref().unwrap_or("unknown error");
            let _ = writeln!(out, "  failed {}: {reason}", job.record.display_title());
        }
    }
    if let Some(cancelled) = snapshot.get(&JobStatus::Cancelled) {
        for job in cancelled.values() {
            let _ = writeln!(out, "  cancelled {}", job.record.display_title());
        }
    }
    out
}

/// True when any job ended in `Error`.
pub(crate) fn has_failures(snapshot: &StatusSnapshot) -> bool {
    snapshot
        .get(&JobStatus::Error)
        .is_some_and(|jobs| !jobs.is_empty())
}
