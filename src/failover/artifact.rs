//! Two-stage artifact persistence.
//!
//! Bytes land in `<staging>/<id>-<random>.part` first and reach the delivery
//! directory through a single rename, so a reader never sees a half-written
//! book. When the rename crosses filesystems the file is copied to
//! `<delivery>/<stem>.crdownload` and renamed from there.
//!
//! An optional post-process command runs on the staged file before it is
//! delivered.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;

/// Errors from writing an artifact to disk.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(
        "failed to write artifact at {path}: {source}\n  Suggestion: check that the staging and delivery directories exist and are writable"
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("post-process command {command} failed: {reason}")]
    PostProcess { command: PathBuf, reason: String },

    #[error("artifact write cancelled")]
    Cancelled,
}

impl ArtifactError {
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    fn post_process(command: &Path, reason: impl Into<String>) -> Self {
        Self::PostProcess {
            command: command.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Bytes of the id digest appended to names that sanitizing changed.
const ID_DIGEST_BYTES: usize = 6;

/// Magic-byte signatures and the extension they imply.
const SIGNATURES: [(&[u8], &str); 5] = [
    (b"PK\x03\x04", "epub"),
    (b"%PDF", "pdf"),
    (b"TPZ", "tpz"),
    (b"ATAB", "azw3"),
    (b"BOOKMOBI", "mobi"),
];

/// Offset of the PalmDOC type/creator field that marks a Mobipocket file.
const MOBI_MARKER_OFFSET: usize = 60;

/// Guesses the book format from the first bytes of a payload.
#[must_use]
pub fn detect_format(bytes: &[u8]) -> Option<&'static str> {
    for (magic, ext) in SIGNATURES {
        if bytes.starts_with(magic) {
            return Some(ext);
        }
    }
    bytes
        .get(MOBI_MARKER_OFFSET..MOBI_MARKER_OFFSET + 8)
        .filter(|marker| *marker == b"BOOKMOBI")
        .map(|_| "mobi")
}

/// Replaces anything that is not safe in a file name.
fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = if ch.is_alphanumeric() || matches!(ch, '-' | '.') {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
            }
            prev_sep = true;
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "book".to_string()
    } else {
        trimmed.to_string()
    }
}

/// File name stem for a job id.
///
/// Ids that are already safe are used as-is. Anything else gets `~` plus a
/// digest of the raw id, so distinct ids never share a stem. Sanitized
/// output never contains `~`.
fn delivery_stem(job_id: &str) -> String {
    let safe = sanitize_component(job_id);
    if safe == job_id {
        return safe;
    }
    let digest = Sha256::digest(job_id.as_bytes());
    format!("{safe}~{}", hex_encode(&digest[..ID_DIGEST_BYTES]))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

async fn remove_interim(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed interim file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove interim file"),
    }
}

/// Removes the staged file unless it has been handed off.
struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.armed {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed staged file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove staged file"),
            }
        }
    }
}

/// Writes verified payloads into the delivery directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    staging_dir: PathBuf,
    delivery_dir: PathBuf,
    detect_format: bool,
    post_process: Option<PathBuf>,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(staging_dir: impl Into<PathBuf>, delivery_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            delivery_dir: delivery_dir.into(),
            detect_format: true,
            post_process: None,
        }
    }

    /// Toggles extension correction from magic bytes.
    #[must_use]
    pub fn with_format_detection(mut self, enabled: bool) -> Self {
        self.detect_format = enabled;
        self
    }

    /// Sets a program to run on each staged artifact before delivery.
    ///
    /// It receives the staged file's path as its only argument. A non-zero
    /// exit fails the candidate.
    #[must_use]
    pub fn with_post_process(mut self, command: Option<PathBuf>) -> Self {
        self.post_process = command;
        self
    }

    #[must_use]
    pub fn delivery_dir(&self) -> &Path {
        &self.delivery_dir
    }

    #[must_use]
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Final path for a job's artifact with the given extension.
    #[must_use]
    pub fn delivery_path(&self, job_id: &str, ext: &str) -> PathBuf {
        self.delivery_dir
            .join(format!("{}.{ext}", delivery_stem(job_id)))
    }

    /// Persists `bytes` as the artifact for `job_id`.
    ///
    /// `declared_ext` comes from the record's format; it is replaced by the
    /// detected format when detection is enabled and the two disagree.
    ///
    /// # Errors
    ///
    /// - [`ArtifactError::Cancelled`] if `cancel` fires before the final rename
    ///   (the staged file is removed)
    /// - [`ArtifactError::PostProcess`] when the post-process command cannot
    ///   start or exits non-zero
    /// - [`ArtifactError::Io`] on any filesystem failure
    #[instrument(skip(self, bytes, cancel), fields(job_id = %job_id, bytes = bytes.len()))]
    pub async fn persist(
        &self,
        job_id: &str,
        bytes: &[u8],
        declared_ext: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, ArtifactError> {
        if cancel.is_signaled() {
            return Err(ArtifactError::Cancelled);
        }

        let ext = self.choose_extension(bytes, declared_ext);
        let safe_id = sanitize_component(job_id);

        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| ArtifactError::io(&self.staging_dir, e))?;
        tokio::fs::create_dir_all(&self.delivery_dir)
            .await
            .map_err(|e| ArtifactError::io(&self.delivery_dir, e))?;

        let suffix: u64 = rand::thread_rng().r#gen();
        let staged_path = self.staging_dir.join(format!("{safe_id}-{suffix:016x}.part"));
        let mut staged = StagedFile::new(staged_path.clone());

        let mut file = tokio::fs::File::create(&staged_path)
            .await
            .map_err(|e| ArtifactError::io(&staged_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| ArtifactError::io(&staged_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| ArtifactError::io(&staged_path, e))?;
        drop(file);

        if let Some(command) = &self.post_process {
            run_post_process(command, &staged_path, cancel).await?;
        }

        if cancel.is_signaled() {
            debug!("cancelled before final rename");
            return Err(ArtifactError::Cancelled);
        }

        let final_path = self.delivery_path(job_id, &ext);
        match tokio::fs::rename(&staged_path, &final_path).await {
            Ok(()) => {
                staged.disarm();
            }
            Err(e) => {
                debug!(error = %e, "rename failed, copying across filesystems");
                let interim = self
                    .delivery_dir
                    .join(format!("{}.crdownload", delivery_stem(job_id)));
                if let Err(e) = tokio::fs::copy(&staged_path, &interim).await {
                    remove_interim(&interim).await;
                    return Err(ArtifactError::io(&interim, e));
                }
                if cancel.is_signaled() {
                    debug!("cancelled before final rename");
                    remove_interim(&interim).await;
                    return Err(ArtifactError::Cancelled);
                }
                if let Err(e) = tokio::fs::rename(&interim, &final_path).await {
                    remove_interim(&interim).await;
                    return Err(ArtifactError::io(&final_path, e));
                }
            }
        }

        debug!(path = %final_path.display(), "artifact delivered");
        Ok(final_path)
    }

    fn choose_extension(&self, bytes: &[u8], declared_ext: &str) -> String {
        if !self.detect_format {
            return declared_ext.to_string();
        }
        match detect_format(bytes) {
            Some(detected) if detected != declared_ext => {
                debug!(declared = declared_ext, detected, "correcting file extension");
                detected.to_string()
            }
            _ => declared_ext.to_string(),
        }
    }
}

async fn run_post_process(
    command: &Path,
    staged: &Path,
    cancel: &CancellationToken,
) -> Result<(), ArtifactError> {
    info!(command = %command.display(), "running post-process command");
    let mut child = tokio::process::Command::new(command)
        .arg(staged)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ArtifactError::post_process(command, e.to_string()))?;

    let status = tokio::select! {
        biased;
        () = cancel.signaled() => return Err(ArtifactError::Cancelled),
        status = child.wait() => status.map_err(|e| ArtifactError::post_process(command, e.to_string()))?,
    };
    if !status.success() {
        return Err(ArtifactError::post_process(command, format!("exited with {status}")));
    }
    Ok(())
}
