//! Per-item failure reporting.
//!
//! Workers report probe failures through a [`FailureSink`]. The file-backed
//! [`FailureLog`] writes one `Failed to process video: <path>` line per
//! failure, holding a lock for the whole line so concurrent workers never
//! interleave output. The file is truncated when the log is created, once
//! per run.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use snafu::prelude::*;

/// Errors raised while opening the failure log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FailureLogError {
    /// The log file (or its parent directory) could not be created.
    #[snafu(display("Cannot create failure log {}: {source}", path.display()))]
    Create {
        /// Log file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Receives per-item failures from workers.
pub trait FailureSink: Send + Sync {
    /// Record that the video at `path` failed for `reason`.
    fn record(&self, path: &str, reason: &str);
}

/// The line written for a failed video.
pub fn failure_line(path: &str) -> String {
    format!("Failed to process video: {path}\n")
}

/// File-backed, append-only failure log.
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    file: Mutex<File>,
    reported: AtomicUsize,
    recorded: AtomicUsize,
}

impl FailureLog {
    /// Create (or truncate) the log at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, FailureLogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(CreateSnafu { path: &path })?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .context(CreateSnafu { path: &path })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            reported: AtomicUsize::new(0),
            recorded: AtomicUsize::new(0),
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of failures reported so far, whether or not their line could
    /// be written.
    pub fn reported(&self) -> usize {
        self.reported.load(Ordering::Relaxed)
    }

    /// Number of failure lines written so far.
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Relaxed)
    }
}

impl FailureSink for FailureLog {
    fn record(&self, path: &str, reason: &str) {
        self.reported.fetch_add(1, Ordering::Relaxed);
        log::warn!("failed to process video {path}: {reason}");

        let line = failure_line(path);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let written = file.write_all(line.as_bytes()).and_then(|()| file.flush());
        drop(file);

        match written {
            Ok(()) => {
                self.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => log::error!(
                "could not append to failure log {}: {e}",
                self.path.display()
            ),
        }
    }
}
