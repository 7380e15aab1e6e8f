//! Runtime settings loaded from TOML.
//!
//! Lookup order for the file:
//! 1. an explicit `--config <path>`
//! 2. `$XDG_CONFIG_HOME/bookdl/config.toml`
//! 3. `$HOME/.config/bookdl/config.toml`
//!
//! Missing default files are not an error. `BOOKDL_FAST_DOWNLOAD_KEY`
//! overrides the fast-download key from the file.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::catalog::{SourceKind, SourcePreference};
use crate::failover::{DEFAULT_MAX_COUNTDOWN_GATES, FastPath};
use crate::transfer::{
    DEFAULT_CONNECTION_BACKOFF_STEP, DEFAULT_CONNECTION_MAX_ATTEMPTS,
    DEFAULT_RATE_LIMIT_BASE_DELAY, DEFAULT_RATE_LIMIT_MAX_ATTEMPTS, RetryPolicy,
    constants::{CONNECT_TIMEOUT_SECS, DEFAULT_MAX_STREAM_RESTARTS, READ_TIMEOUT_SECS},
};

/// Environment variable that overrides `fast_download_key`.
pub const FAST_DOWNLOAD_KEY_ENV: &str = "BOOKDL_FAST_DOWNLOAD_KEY";

/// Errors from loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "failed to parse config file {path}: {source}\n  Suggestion: check the TOML syntax and key names"
    )]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for `{key}`: {value}. Expected range: {expected}")]
    OutOfRange {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl ConfigError {
    fn out_of_range(key: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::OutOfRange {
            key,
            value: value.to_string(),
            expected,
        }
    }
}

/// All tunables, with defaults for anything the file leaves out.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub max_concurrent_downloads: usize,
    pub poll_interval_ms: u64,
    pub delivery_dir: PathBuf,
    /// Defaults to `<delivery_dir>/.staging` when unset.
    pub staging_dir: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub rate_limit_max_attempts: u32,
    pub rate_limit_base_delay_ms: u64,
    pub connection_max_attempts: u32,
    pub connection_backoff_step_ms: u64,
    pub max_stream_restarts: u32,
    pub max_countdown_gates: u32,
    pub max_countdown_wait_secs: u64,
    pub page_fetch_max_retries: u32,
    pub page_fetch_backoff_ms: u64,
    pub fast_download_base_url: Option<String>,
    pub fast_download_key: Option<String>,
    pub source_order: Vec<SourceKind>,
    pub detect_format: bool,
    pub libgen_mirror_host: Option<String>,
    /// Program run on each verified artifact before delivery, with the
    /// staged file's path as its argument.
    pub post_process_command: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            poll_interval_ms: 250,
            delivery_dir: PathBuf::from("."),
            staging_dir: None,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            rate_limit_max_attempts: DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
            rate_limit_base_delay_ms: duration_ms(DEFAULT_RATE_LIMIT_BASE_DELAY),
            connection_max_attempts: DEFAULT_CONNECTION_MAX_ATTEMPTS,
            connection_backoff_step_ms: duration_ms(DEFAULT_CONNECTION_BACKOFF_STEP),
            max_stream_restarts: DEFAULT_MAX_STREAM_RESTARTS,
            max_countdown_gates: DEFAULT_MAX_COUNTDOWN_GATES,
            max_countdown_wait_secs: 600,
            page_fetch_max_retries: 3,
            page_fetch_backoff_ms: 5000,
            fast_download_base_url: None,
            fast_download_key: None,
            source_order: SourcePreference::default().kinds().to_vec(),
            detect_format: true,
            libgen_mirror_host: None,
            post_process_command: None,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Settings {
    /// Parses settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML or unknown keys, and
    /// [`ConfigError::OutOfRange`] when a value fails validation.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// See [`Settings::from_toml`]; also [`ConfigError::Read`] if the file
    /// cannot be read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_toml(&text, path)
    }

    /// Loads `explicit` if given, else the default file when it exists, else
    /// the defaults. The environment key override is applied last.
    ///
    /// # Errors
    ///
    /// Propagates [`Settings::load`] failures.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match explicit {
            Some(path) => Self::load(path)?,
            None => match default_path().filter(|p| p.exists()) {
                Some(path) => Self::load(&path)?,
                None => Self::default(),
            },
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Applies environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(key) = env::var(FAST_DOWNLOAD_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
        {
            self.fast_download_key = Some(key);
        }
    }

    /// Checks every value against its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.max_concurrent_downloads) {
            return Err(ConfigError::out_of_range(
                "max_concurrent_downloads",
                self.max_concurrent_downloads,
                "1..=100",
            ));
        }
        if !(10..=60_000).contains(&self.poll_interval_ms) {
            return Err(ConfigError::out_of_range(
                "poll_interval_ms",
                self.poll_interval_ms,
                "10..=60000",
            ));
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        validate_attempts("rate_limit_max_attempts", self.rate_limit_max_attempts)?;
        validate_attempts("connection_max_attempts", self.connection_max_attempts)?;
        validate_attempts("page_fetch_max_retries", self.page_fetch_max_retries)?;
        if self.max_stream_restarts > 10 {
            return Err(ConfigError::out_of_range(
                "max_stream_restarts",
                self.max_stream_restarts,
                "0..=10",
            ));
        }
        if self.max_countdown_gates > 10 {
            return Err(ConfigError::out_of_range(
                "max_countdown_gates",
                self.max_countdown_gates,
                "0..=10",
            ));
        }
        validate_timeout_secs("max_countdown_wait_secs", self.max_countdown_wait_secs)?;
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.delivery_dir.join(".staging"))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    #[must_use]
    pub fn max_countdown_wait(&self) -> Duration {
        Duration::from_secs(self.max_countdown_wait_secs)
    }

    #[must_use]
    pub fn page_fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.page_fetch_backoff_ms)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.rate_limit_max_attempts,
            Duration::from_millis(self.rate_limit_base_delay_ms),
            self.connection_max_attempts,
            Duration::from_millis(self.connection_backoff_step_ms),
        )
    }

    #[must_use]
    pub fn source_preference(&self) -> SourcePreference {
        SourcePreference::new(self.source_order.clone())
    }

    /// Fast-download credentials, when both base URL and key are set.
    #[must_use]
    pub fn fast_path(&self) -> Option<FastPath> {
        let base_url = self.fast_download_base_url.clone()?;
        let key = self.fast_download_key.clone()?;
        Some(FastPath { base_url, key })
    }
}

fn validate_timeout_secs(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if (1..=3600).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(key, value, "1..=3600"))
    }
}

fn validate_attempts(key: &'static str, value: u32) -> Result<(), ConfigError> {
    if (1..=20).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(key, value, "1..=20"))
    }
}

/// Resolves the default config path.
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("bookdl").join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("bookdl")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
