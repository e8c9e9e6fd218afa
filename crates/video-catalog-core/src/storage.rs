//! Filesystem helpers for the on-disk column store.
//!
//! All paths handed to these helpers are relative to a [`StoreLocation`]
//! root. The store relies on two write primitives:
//!
//! - [`write_atomic`]: write-then-rename replacement, used for table manifests
//!   so a reader never observes a half-written manifest.
//! - [`write_new`]: create-only writes, used for data segments so a segment
//!   file is never silently overwritten.
//!
//! Only the local filesystem is supported.

use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};

use snafu::{Backtrace, prelude::*};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// Result type of storage helpers.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root directory of a column store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreLocation {
    /// A store rooted at a local directory.
    Local(PathBuf),
}

impl StoreLocation {
    /// Store rooted at a local directory.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StoreLocation::Local(root.into())
    }

    /// Absolute path of `rel` under this root.
    pub fn join(&self, rel: &Path) -> PathBuf {
        match self {
            StoreLocation::Local(root) => root.join(rel),
        }
    }
}

/// Backend-specific failure wrapped by [`StorageError`].
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors raised by storage helpers.
#[derive(Debug, Snafu)]
pub enum StorageError {
    /// The path does not exist.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The missing path.
        path: String,
        /// Underlying backend error.
        source: BackendError,
        /// Backtrace at the point of failure.
        backtrace: Backtrace,
    },

    /// The path already exists and create-only semantics were requested.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The existing path.
        path: String,
        /// Underlying backend error.
        source: BackendError,
        /// Backtrace at the point of failure.
        backtrace: Backtrace,
    },

    /// Any other I/O failure.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// Path being accessed.
        path: String,
        /// Underlying backend error.
        source: BackendError,
        /// Backtrace at the point of failure.
        backtrace: Backtrace,
    },
}

fn classify(path: &Path, e: io::Error) -> StorageError {
    let path = path.display().to_string();
    let backtrace = Backtrace::capture();
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace,
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace,
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace,
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| classify(parent, e))?;
    }
    Ok(())
}

/// Removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best effort; the caller is already returning an error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replace the file at `rel_path` with `contents` via write, sync, rename.
pub async fn write_atomic(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = abs.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| classify(&tmp_path, e))?;
        file.write_all(contents)
            .await
            .map_err(|e| classify(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| classify(&tmp_path, e))?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(|e| classify(&abs, e))?;
    guard.disarm();
    Ok(())
}

/// Create `rel_path` with `contents`, failing with
/// [`StorageError::AlreadyExists`] if it is already there.
pub async fn write_new(
    location: &StoreLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(|e| classify(&abs, e))?;

    file.write_all(contents)
        .await
        .map_err(|e| classify(&abs, e))?;
    file.sync_all().await.map_err(|e| classify(&abs, e))?;
    Ok(())
}

/// Read a whole file as UTF-8.
pub async fn read_to_string(location: &StoreLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.join(rel_path);
    fs::read_to_string(&abs).await.map_err(|e| classify(&abs, e))
}

/// Read a whole file as bytes.
pub async fn read_all_bytes(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<u8>> {
    let abs = location.join(rel_path);
    fs::read(&abs).await.map_err(|e| classify(&abs, e))
}

/// Recursively delete a directory. A missing directory is not an error.
pub async fn remove_dir_all(location: &StoreLocation, rel_path: &Path) -> StorageResult<()> {
    let abs = location.join(rel_path);
    match fs::remove_dir_all(&abs).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(&abs, e)),
    }
}

/// Rename `from` to `to` within the same location. On a local filesystem
/// this is a single atomic step.
pub async fn rename(location: &StoreLocation, from: &Path, to: &Path) -> StorageResult<()> {
    let src = location.join(from);
    let dst = location.join(to);
    fs::rename(&src, &dst).await.map_err(|e| classify(&src, e))
}

/// Names of the immediate subdirectories of `rel_path`, sorted.
/// A missing directory has no children.
pub async fn list_dirs(location: &StoreLocation, rel_path: &Path) -> StorageResult<Vec<String>> {
    let abs = location.join(rel_path);
    let mut entries = match fs::read_dir(&abs).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(classify(&abs, e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| classify(&abs, e))? {
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| classify(&entry.path(), e))?
            .is_dir();
        if is_dir {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[tokio::test]
    async fn write_atomic_creates_parents_and_replaces() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel = Path::new("videos/_table.json");

        write_atomic(&location, rel, b"v1").await?;
        write_atomic(&location, rel, b"v2").await?;

        assert_eq!(read_to_string(&location, rel).await?, "v2");
        assert!(!tmp.path().join("videos/_table.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn write_new_refuses_to_overwrite() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let rel = Path::new("t/data/seg-000001.parquet");

        write_new(&location, rel, b"first").await?;
        let err = write_new(&location, rel, b"second")
            .await
            .expect_err("second create must fail");
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(read_all_bytes(&location, rel).await?, b"first");
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        let err = read_to_string(&location, Path::new("nope.json"))
            .await
            .expect_err("missing file");
        assert!(matches!(err, StorageError::NotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn list_and_remove_dirs() -> TestResult {
        let tmp = TempDir::new()?;
        let location = StoreLocation::local(tmp.path());
        write_new(&location, Path::new("b/x"), b"").await?;
        write_new(&location, Path::new("a/x"), b"").await?;
        write_new(&location, Path::new("file"), b"").await?;

        assert_eq!(list_dirs(&location, Path::new("")).await?, vec!["a", "b"]);

        remove_dir_all(&location, Path::new("a")).await?;
        remove_dir_all(&location, Path::new("a")).await?;
        assert_eq!(list_dirs(&location, Path::new("")).await?, vec!["b"]);
        assert!(list_dirs(&location, Path::new("missing")).await?.is_empty());
        Ok(())
    }
}
