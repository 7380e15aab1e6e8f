//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download books listed in a manifest, falling back across mirrors.
///
/// The manifest is a JSON array of book records, each with an `id` and a list
/// of `download_urls`. It is read from MANIFEST or, when omitted, from stdin.
#[derive(Parser, Debug)]
#[command(name = "bookdl")]
#[command(author, version, about)]
pub struct Args {
    /// Manifest file (JSON array of book records); reads stdin when omitted
    pub manifest: Option<PathBuf>,

    /// Directory delivered books are written to
    #[arg(short = 'o', long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Priority given to every manifest entry (lower runs first)
    #[arg(short = 'p', long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i64,

    /// Config file (defaults to $XDG_CONFIG_HOME/bookdl/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

impl Args {
    /// Log level implied by -v/-q, and whether it was asked for explicitly.
    #[must_use]
    pub fn log_level(&self) -> (&'static str, bool) {
        if self.quiet {
            ("error", true)
        } else {
            match self.verbose {
                0 => ("info", false),
                1 => ("debug", true),
                _ => ("trace", true),
            }
        }
    }
}
