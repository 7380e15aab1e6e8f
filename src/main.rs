//! CLI entry point for bookdl.

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use bookdl_core::{DownloadService, JobQueue, Settings, StaticCatalog};
use clap::Parser;
use tracing::{debug, info, warn};

mod cli;
mod output;
mod progress;
mod terminal;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let (default_level, force_cli_level) = args.log_level();
    let no_color = terminal::should_disable_color(
        args.no_color,
        terminal::no_color_env_requested(),
        terminal::is_dumb_terminal(),
    );
    terminal::init_tracing(default_level, force_cli_level, no_color);
    debug!(?args, "CLI arguments parsed");

    let mut settings = Settings::load_or_default(args.config.as_deref())
        .context("could not load configuration")?;
    if let Some(dir) = &args.output_dir {
        settings.delivery_dir.clone_from(dir);
    }
    if let Some(concurrency) = args.concurrency {
        settings.max_concurrent_downloads = usize::from(concurrency);
    }
    settings.validate()?;

    let catalog = match &args.manifest {
        Some(path) => StaticCatalog::load(path)
            .with_context(|| format!("could not read manifest {}", path.display()))?,
        None if !io::stdin().is_terminal() => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            if buffer.trim().is_empty() {
                info!("No manifest provided on stdin.");
                return Ok(ExitCode::SUCCESS);
            }
            StaticCatalog::from_json(&buffer).context("could not parse manifest from stdin")?
        }
        None => {
            info!("No manifest provided. Pass a JSON manifest path or pipe one via stdin.");
            info!("Example: bookdl books.json -o ~/Books");
            return Ok(ExitCode::SUCCESS);
        }
    };

    if catalog.is_empty() {
        info!("Manifest contains no books");
        return Ok(ExitCode::SUCCESS);
    }

    let records = catalog.records().to_vec();
    let queue = Arc::new(JobQueue::new());
    let service = DownloadService::new(Arc::clone(&queue), Arc::new(catalog))
        .with_preference(settings.source_preference());
    let total = records
        .into_iter()
        .filter(|record| service.enqueue_record(record.clone(), args.priority))
        .count();
    info!(
        total,
        concurrency = settings.max_concurrent_downloads,
        output_dir = %settings.delivery_dir.display(),
        "Starting downloads"
    );

    let handle = service.start_with_settings(&settings)?;

    let use_spinner = terminal::should_use_spinner(
        io::stderr().is_terminal(),
        args.quiet,
        terminal::is_dumb_terminal(),
    );
    let (progress_handle, progress_stop) =
        progress::spawn_progress_ui(use_spinner, Arc::clone(&queue), total);

    let poll = settings.poll_interval();
    let interrupted = tokio::select! {
        () = service.wait_until_settled(poll) => false,
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "could not listen for Ctrl+C");
                service.wait_until_settled(poll).await;
                false
            }
        },
    };

    let stats = if interrupted {
        warn!("Interrupted, cancelling active downloads");
        handle.shutdown_and_cancel().await?
    } else {
        handle.shutdown().await?
    };

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        total,
        "Download complete"
    );

    let snapshot = service.query_status();
    print!("{}", output::render_summary(&snapshot));

    if output::has_failures(&snapshot) {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
