//! On-disk column store: one directory of Parquet segments per table.
//!
//! Layout under the store root:
//!
//! ```text
//! <table>/_table.json              manifest: schema + ordered segment list
//! <table>/data/seg-000000.parquet  one segment per appended batch
//! ```
//!
//! An append writes its segment with create-only semantics and then replaces
//! the manifest atomically. A segment that is not listed in the manifest is
//! invisible, so a failed append leaves the table unchanged.
use std::path::{Path, PathBuf};

use arrow::array::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::{
    arrow::{
        ArrowWriter, ProjectionMask,
        arrow_reader::{ParquetRecordBatchReaderBuilder, RowSelection, RowSelector},
    },
    basic::Compression,
    file::properties::WriterProperties,
};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    column_store::{
        ArrowSnafu, ColumnStore, CorruptSnafu, ManifestSnafu, ParquetSnafu, StorageSnafu,
        StoreResult, TableExistsSnafu, TableNotFoundSnafu,
        batch::{batch_to_records, filter_eq, rows_to_batch},
        check_predicate, check_rows, column_index, project, sort_records, validate_table_name,
    },
    record::{FieldValue, ProcessedRecord},
    schema::RecordSchema,
    storage::{self, StorageError, StoreLocation},
};

const MANIFEST_FILE: &str = "_table.json";
const DATA_DIR: &str = "data";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentEntry {
    /// Path relative to the table directory.
    path: String,
    row_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableManifest {
    version: u32,
    created_at: DateTime<Utc>,
    schema: RecordSchema,
    segments: Vec<SegmentEntry>,
    next_segment: u64,
}

impl TableManifest {
    fn row_count(&self) -> u64 {
        self.segments.iter().map(|s| s.row_count).sum()
    }
}

fn manifest_path(table: &str) -> PathBuf {
    Path::new(table).join(MANIFEST_FILE)
}

/// A [`ColumnStore`] persisting each table as Parquet segments.
#[derive(Debug, Clone)]
pub struct ParquetStore {
    location: StoreLocation,
}

impl ParquetStore {
    /// Store rooted at `location`. Nothing is touched until the first call.
    pub fn new(location: StoreLocation) -> Self {
        Self { location }
    }

    /// Root of this store.
    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    async fn load_manifest(&self, table: &str) -> StoreResult<Option<TableManifest>> {
        match storage::read_to_string(&self.location, &manifest_path(table)).await {
            Ok(json) => {
                let manifest: TableManifest =
                    serde_json::from_str(&json).context(ManifestSnafu { table })?;
                ensure!(
                    manifest.version == MANIFEST_VERSION,
                    CorruptSnafu {
                        table,
                        details: format!("unsupported manifest version {}", manifest.version),
                    }
                );
                Ok(Some(manifest))
            }
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(source) => Err(source).context(StorageSnafu { table }),
        }
    }

    /// When `name` was created, or `None` if it does not exist.
    pub async fn table_created_at(&self, name: &str) -> StoreResult<Option<DateTime<Utc>>> {
        validate_table_name(name)?;
        Ok(self.load_manifest(name).await?.map(|m| m.created_at))
    }

    async fn require_manifest(&self, table: &str) -> StoreResult<TableManifest> {
        validate_table_name(table)?;
        self.load_manifest(table)
            .await?
            .context(TableNotFoundSnafu { table })
    }

    async fn commit_manifest(&self, table: &str, manifest: &TableManifest) -> StoreResult<()> {
        let json = serde_json::to_vec_pretty(manifest).context(ManifestSnafu { table })?;
        storage::write_atomic(&self.location, &manifest_path(table), &json)
            .await
            .context(StorageSnafu { table })
    }

    async fn read_segment(
        &self,
        table: &str,
        segment: &SegmentEntry,
        selection: Option<RowSelection>,
        projection: Option<&[usize]>,
    ) -> StoreResult<Vec<RecordBatch>> {
        let rel_path = Path::new(table).join(&segment.path);
        let bytes = storage::read_all_bytes(&self.location, &rel_path)
            .await
            .context(StorageSnafu { table })?;

        let mut builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))
            .context(ParquetSnafu { table })?;
        if let Some(indices) = projection {
            let mask = ProjectionMask::roots(builder.parquet_schema(), indices.iter().copied());
            builder = builder.with_projection(mask);
        }
        if let Some(selection) = selection {
            builder = builder.with_row_selection(selection);
        }

        let reader = builder.build().context(ParquetSnafu { table })?;
        reader
            .map(|batch| batch.context(ArrowSnafu { table }))
            .collect()
    }

    /// Every row of `table` in storage order, checking segment row counts.
    async fn read_all(
        &self,
        table: &str,
        manifest: &TableManifest,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        let mut out = Vec::with_capacity(manifest.row_count() as usize);
        for segment in &manifest.segments {
            let mut decoded = 0u64;
            for batch in self.read_segment(table, segment, None, None).await? {
                decoded += batch.num_rows() as u64;
                out.extend(batch_to_records(table, &batch)?);
            }
            ensure!(
                decoded == segment.row_count,
                CorruptSnafu {
                    table,
                    details: format!(
                        "segment {} holds {decoded} rows, manifest says {}",
                        segment.path, segment.row_count
                    ),
                }
            );
        }
        Ok(out)
    }
}

fn encode_segment(table: &str, batch: &RecordBatch) -> StoreResult<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))
        .context(ParquetSnafu { table })?;
    writer.write(batch).context(ParquetSnafu { table })?;
    writer.close().context(ParquetSnafu { table })?;
    Ok(buf)
}

impl ColumnStore for ParquetStore {
    async fn create_table(&mut self, name: &str, schema: &RecordSchema) -> StoreResult<()> {
        validate_table_name(name)?;
        ensure!(
            self.load_manifest(name).await?.is_none(),
            TableExistsSnafu { table: name }
        );

        let manifest = TableManifest {
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
            schema: schema.clone(),
            segments: Vec::new(),
            next_segment: 0,
        };
        self.commit_manifest(name, &manifest).await?;
        log::debug!("created table {name} with {} columns", schema.columns().len());
        Ok(())
    }

    async fn table_schema(&self, name: &str) -> StoreResult<Option<RecordSchema>> {
        validate_table_name(name)?;
        Ok(self.load_manifest(name).await?.map(|m| m.schema))
    }

    async fn append_rows(&mut self, name: &str, rows: &[Vec<FieldValue>]) -> StoreResult<u64> {
        let mut manifest = self.require_manifest(name).await?;
        check_rows(name, &manifest.schema, rows)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let batch = rows_to_batch(name, &manifest.schema, rows)?;
        let bytes = encode_segment(name, &batch)?;

        let seg_path = format!("{DATA_DIR}/seg-{:06}.parquet", manifest.next_segment);
        storage::write_new(&self.location, &Path::new(name).join(&seg_path), &bytes)
            .await
            .context(StorageSnafu { table: name })?;

        let appended = rows.len() as u64;
        manifest.segments.push(SegmentEntry {
            path: seg_path,
            row_count: appended,
        });
        manifest.next_segment += 1;
        self.commit_manifest(name, &manifest).await?;
        Ok(appended)
    }

    async fn scan_ordered(
        &self,
        name: &str,
        order_by: &[&str],
    ) -> StoreResult<Vec<ProcessedRecord>> {
        let manifest = self.require_manifest(name).await?;
        for column in order_by {
            column_index(name, &manifest.schema, column)?;
        }
        let mut records = self.read_all(name, &manifest).await?;
        sort_records(name, &manifest.schema, &mut records, order_by)?;
        Ok(records)
    }

    async fn read_rows(
        &self,
        name: &str,
        offset: u64,
        limit: u64,
        columns: Option<&[String]>,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        let manifest = self.require_manifest(name).await?;
        let projection = match columns {
            Some(cols) => Some(
                cols.iter()
                    .map(|c| column_index(name, &manifest.schema, c))
                    .collect::<StoreResult<Vec<_>>>()?,
            ),
            None => None,
        };

        let total = manifest.row_count();
        let end = offset.saturating_add(limit).min(total);
        if offset >= end {
            return Ok(Vec::new());
        }
        if projection.as_ref().is_some_and(Vec::is_empty) {
            return Ok((offset..end).map(|_| ProcessedRecord::new()).collect());
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut seg_start = 0u64;
        for segment in &manifest.segments {
            let seg_end = seg_start + segment.row_count;
            if seg_end > offset && seg_start < end {
                let skip = offset.saturating_sub(seg_start);
                let take = end.min(seg_end) - seg_start - skip;
                let mut selectors = Vec::with_capacity(2);
                if skip > 0 {
                    selectors.push(RowSelector::skip(skip as usize));
                }
                selectors.push(RowSelector::select(take as usize));
                let selection = RowSelection::from(selectors);
                let batches = self
                    .read_segment(name, segment, Some(selection), projection.as_deref())
                    .await?;
                for batch in batches {
                    out.extend(batch_to_records(name, &batch)?);
                }
            }
            if seg_end >= end {
                break;
            }
            seg_start = seg_end;
        }

        Ok(match columns {
            Some(cols) => out.into_iter().map(|r| project(r, cols)).collect(),
            None => out,
        })
    }

    async fn find_eq(
        &self,
        name: &str,
        column: &str,
        value: &FieldValue,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        let manifest = self.require_manifest(name).await?;
        let idx = check_predicate(name, &manifest.schema, column, value)?;

        let mut out = Vec::new();
        for segment in &manifest.segments {
            for batch in self.read_segment(name, segment, None, None).await? {
                let matched = filter_eq(name, &batch, idx, value)?;
                if matched.num_rows() > 0 {
                    out.extend(batch_to_records(name, &matched)?);
                }
            }
        }
        Ok(out)
    }

    async fn row_count(&self, name: &str) -> StoreResult<u64> {
        Ok(self.require_manifest(name).await?.row_count())
    }

    async fn drop_table(&mut self, name: &str) -> StoreResult<bool> {
        validate_table_name(name)?;
        let existed = self.load_manifest(name).await?.is_some();
        storage::remove_dir_all(&self.location, Path::new(name))
            .await
            .context(StorageSnafu { table: name })?;
        if existed {
            log::debug!("dropped table {name}");
        }
        Ok(existed)
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> StoreResult<()> {
        validate_table_name(to)?;
        self.require_manifest(from).await?;
        ensure!(
            self.load_manifest(to).await?.is_none(),
            TableExistsSnafu { table: to }
        );
        // A directory without a manifest is debris from an interrupted write.
        storage::remove_dir_all(&self.location, Path::new(to))
            .await
            .context(StorageSnafu { table: to })?;
        storage::rename(&self.location, Path::new(from), Path::new(to))
            .await
            .context(StorageSnafu { table: from })?;
        log::debug!("renamed table {from} to {to}");
        Ok(())
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        let dirs = storage::list_dirs(&self.location, Path::new(""))
            .await
            .context(StorageSnafu { table: "" })?;

        let mut tables = Vec::with_capacity(dirs.len());
        for dir in dirs {
            if validate_table_name(&dir).is_ok() && self.load_manifest(&dir).await?.is_some() {
                tables.push(dir);
            }
        }
        Ok(tables)
    }
}
