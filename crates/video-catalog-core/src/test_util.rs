//! Test doubles shared by unit tests.
use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crate::{
    column_store::{ColumnStore, StoreError, StoreResult},
    failure_log::FailureSink,
    probe::{DecodeError, Decoder, VideoStats},
    record::{FieldValue, ProcessedRecord},
    schema::RecordSchema,
};

/// Decoder answering from a fixed table of paths.
#[derive(Debug, Default, Clone)]
pub(crate) struct ScriptedDecoder {
    videos: HashMap<String, VideoStats>,
    delay: Option<Duration>,
    path_delays: HashMap<String, Duration>,
}

impl ScriptedDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_video(
        mut self,
        path: &str,
        frames: i64,
        fps: f64,
        width: i64,
        height: i64,
    ) -> Self {
        self.videos.insert(
            path.to_string(),
            VideoStats {
                frame_count: frames,
                avg_fps: fps,
                width,
                height,
            },
        );
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay opens of `path` only; overrides [`ScriptedDecoder::with_delay`].
    pub(crate) fn with_path_delay(mut self, path: &str, delay: Duration) -> Self {
        self.path_delays.insert(path.to_string(), delay);
        self
    }
}

impl Decoder for ScriptedDecoder {
    fn open(&self, path: &Path, timeout: Option<Duration>) -> Result<VideoStats, DecodeError> {
        let key = path.to_string_lossy();
        if let Some(delay) = self.path_delays.get(key.as_ref()).copied().or(self.delay) {
            match timeout {
                Some(limit) if limit < delay => {
                    thread::sleep(limit);
                    return Err(DecodeError::TimedOut {
                        path: key.into_owned(),
                        limit,
                    });
                }
                _ => thread::sleep(delay),
            }
        }
        self.videos
            .get(key.as_ref())
            .copied()
            .ok_or_else(|| DecodeError::Corrupt {
                path: key.into_owned(),
                message: "scripted decode failure".to_string(),
            })
    }
}

/// Failure sink keeping every event in memory.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub(crate) fn paths(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }
}

impl FailureSink for RecordingSink {
    fn record(&self, path: &str, reason: &str) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((path.to_string(), reason.to_string()));
    }
}

/// Store wrapper counting calls that read row data.
#[derive(Debug, Default)]
pub(crate) struct CountingStore<S> {
    inner: S,
    reads: AtomicUsize,
}

impl<S> CountingStore<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
        }
    }

    /// Calls to `read_rows`, `find_eq` and `scan_ordered` so far.
    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }
}

impl<S: ColumnStore> ColumnStore for CountingStore<S> {
    async fn create_table(&mut self, name: &str, schema: &RecordSchema) -> StoreResult<()> {
        self.inner.create_table(name, schema).await
    }

    async fn table_schema(&self, name: &str) -> StoreResult<Option<RecordSchema>> {
        self.inner.table_schema(name).await
    }

    async fn append_rows(&mut self, name: &str, rows: &[Vec<FieldValue>]) -> StoreResult<u64> {
        self.inner.append_rows(name, rows).await
    }

    async fn scan_ordered(
        &self,
        name: &str,
        order_by: &[&str],
    ) -> StoreResult<Vec<ProcessedRecord>> {
        self.count();
        self.inner.scan_ordered(name, order_by).await
    }

    async fn read_rows(
        &self,
        name: &str,
        offset: u64,
        limit: u64,
        columns: Option<&[String]>,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        self.count();
        self.inner.read_rows(name, offset, limit, columns).await
    }

    async fn find_eq(
        &self,
        name: &str,
        column: &str,
        value: &FieldValue,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        self.count();
        self.inner.find_eq(name, column, value).await
    }

    async fn row_count(&self, name: &str) -> StoreResult<u64> {
        self.inner.row_count(name).await
    }

    async fn drop_table(&mut self, name: &str) -> StoreResult<bool> {
        self.inner.drop_table(name).await
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> StoreResult<()> {
        self.inner.rename_table(from, to).await
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.inner.list_tables().await
    }
}

/// Store wrapper whose appends to one table always fail.
#[derive(Debug)]
pub(crate) struct FailingAppendStore<S> {
    inner: S,
    table: String,
}

impl<S> FailingAppendStore<S> {
    pub(crate) fn new(inner: S, table: impl Into<String>) -> Self {
        Self {
            inner,
            table: table.into(),
        }
    }

    pub(crate) fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ColumnStore> ColumnStore for FailingAppendStore<S> {
    async fn create_table(&mut self, name: &str, schema: &RecordSchema) -> StoreResult<()> {
        self.inner.create_table(name, schema).await
    }

    async fn table_schema(&self, name: &str) -> StoreResult<Option<RecordSchema>> {
        self.inner.table_schema(name).await
    }

    async fn append_rows(&mut self, name: &str, rows: &[Vec<FieldValue>]) -> StoreResult<u64> {
        if name == self.table {
            return Err(StoreError::Corrupt {
                table: name.to_string(),
                details: "simulated segment write failure".to_string(),
            });
        }
        self.inner.append_rows(name, rows).await
    }

    async fn scan_ordered(
        &self,
        name: &str,
        order_by: &[&str],
    ) -> StoreResult<Vec<ProcessedRecord>> {
        self.inner.scan_ordered(name, order_by).await
    }

    async fn read_rows(
        &self,
        name: &str,
        offset: u64,
        limit: u64,
        columns: Option<&[String]>,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        self.inner.read_rows(name, offset, limit, columns).await
    }

    async fn find_eq(
        &self,
        name: &str,
        column: &str,
        value: &FieldValue,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        self.inner.find_eq(name, column, value).await
    }

    async fn row_count(&self, name: &str) -> StoreResult<u64> {
        self.inner.row_count(name).await
    }

    async fn drop_table(&mut self, name: &str) -> StoreResult<bool> {
        self.inner.drop_table(name).await
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> StoreResult<()> {
        self.inner.rename_table(from, to).await
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.inner.list_tables().await
    }
}
