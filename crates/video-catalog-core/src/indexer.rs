//! Global ordering and row numbering.
//!
//! The indexer reads every row of the staging table, sorts them once by
//! `(bucket, aspect_ratio, filename)` and writes them, in that order, to a
//! fresh table with an extra 1-based `row_no` column. The sort is stable, so
//! rebuilding from the same staging table always assigns the same numbers.
//!
//! Rows are stored in `row_no` order: row `n` lives at position `n - 1`.
//!
//! The new table is filled under a scratch name and renamed into place only
//! once complete, so a failed build never replaces a good index with a
//! partial one.
use snafu::prelude::*;

use crate::{
    column_store::{ColumnStore, StoreError},
    record::{ASPECT_RATIO, FILENAME, FieldValue, ROW_NO},
    schema::{ColumnSpec, FieldType, SchemaError},
};

/// Errors raised while building an index.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IndexError {
    /// The source table does not exist.
    #[snafu(display("Cannot index {table}: table does not exist"))]
    SourceMissing {
        /// Source table.
        table: String,
    },

    /// An ordering key is not a column of the source table.
    #[snafu(display("Cannot index {table}: missing ordering column {column}"))]
    MissingKey {
        /// Source table.
        table: String,
        /// The missing key.
        column: String,
    },

    /// The source already has a `row_no` column.
    #[snafu(display("Cannot index {table}: {source}"))]
    RowNoColumn {
        /// Source table.
        table: String,
        /// Underlying schema error.
        source: SchemaError,
    },

    /// The store rejected an operation.
    #[snafu(display("Store error while indexing {table}: {source}"))]
    Store {
        /// Table being read or written.
        table: String,
        /// Underlying store error.
        source: StoreError,
    },
}

/// Summary of one index build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexReport {
    /// Table that was read.
    pub source: String,
    /// Table that was written.
    pub target: String,
    /// Rows written to `target`.
    pub rows: u64,
    /// Whether `source` was dropped afterwards.
    pub source_dropped: bool,
}

/// The composite ordering key, most significant first.
pub fn order_keys(bucket_field: &str) -> [&str; 3] {
    [bucket_field, ASPECT_RATIO, FILENAME]
}

/// Name under which `target` is built before it is swapped in.
pub fn scratch_table(target: &str) -> String {
    format!("{target}_building")
}

/// Sort `source` into a new `target` table with a `row_no` column.
///
/// Any existing `target` is replaced, but only after the new table is
/// complete; on failure the old `target` and `source` are left as they were.
/// `source` is dropped afterwards when `drop_source` is set and left
/// untouched otherwise.
pub async fn build_index<S: ColumnStore>(
    store: &mut S,
    source: &str,
    target: &str,
    bucket_field: &str,
    drop_source: bool,
) -> Result<IndexReport, IndexError> {
    let schema = store
        .table_schema(source)
        .await
        .context(StoreSnafu { table: source })?
        .context(SourceMissingSnafu { table: source })?;

    let keys = order_keys(bucket_field);
    for key in keys {
        ensure!(
            schema.column(key).is_some(),
            MissingKeySnafu {
                table: source,
                column: key
            }
        );
    }
    let indexed_schema = schema
        .with_column(ColumnSpec::new(ROW_NO, FieldType::Integer))
        .context(RowNoColumnSnafu { table: source })?;

    let sorted = store
        .scan_ordered(source, &keys)
        .await
        .context(StoreSnafu { table: source })?;

    let rows: Vec<Vec<FieldValue>> = sorted
        .into_iter()
        .zip(1i64..)
        .map(|(record, row_no)| {
            let mut values: Vec<FieldValue> =
                record.into_fields().into_iter().map(|(_, v)| v).collect();
            values.push(FieldValue::Integer(row_no));
            values
        })
        .collect();

    let scratch = scratch_table(target);
    if store
        .drop_table(&scratch)
        .await
        .context(StoreSnafu { table: &scratch })?
    {
        log::warn!("dropped leftover scratch table {scratch}");
    }
    store
        .create_table(&scratch, &indexed_schema)
        .await
        .context(StoreSnafu { table: &scratch })?;
    let written = match store.append_rows(&scratch, &rows).await {
        Ok(written) => written,
        Err(source) => {
            if let Err(e) = store.drop_table(&scratch).await {
                log::warn!("could not drop scratch table {scratch}: {e}");
            }
            return Err(source).context(StoreSnafu { table: &scratch });
        }
    };

    if store
        .drop_table(target)
        .await
        .context(StoreSnafu { table: target })?
    {
        log::warn!("replacing existing index table {target}");
    }
    store
        .rename_table(&scratch, target)
        .await
        .context(StoreSnafu { table: target })?;

    if drop_source {
        store
            .drop_table(source)
            .await
            .context(StoreSnafu { table: source })?;
    }

    log::info!("indexed {written} rows from {source} into {target}");
    Ok(IndexReport {
        source: source.to_string(),
        target: target.to_string(),
        rows: written,
        source_dropped: drop_source,
    })
}
