//! The column store capability and its implementations.
//!
//! A [`ColumnStore`] holds named, typed tables of rows:
//! - tables are created once with a [`RecordSchema`] and never altered,
//! - rows are appended in batches, and each batch is all-or-nothing,
//! - values are bound by type, never spliced into query text,
//! - ordered scans are stable: rows with equal keys keep insertion order.
//!
//! Two implementations are provided: [`ParquetStore`] (one directory of
//! Parquet segments per table) and [`MemoryStore`] (in-process).

mod batch;
pub mod memory;
pub mod parquet_store;

use std::cmp::Ordering;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use snafu::prelude::*;

use crate::{
    record::{FieldValue, ProcessedRecord},
    schema::{FieldType, RecordSchema},
    storage::StorageError,
};

pub use memory::MemoryStore;
pub use parquet_store::ParquetStore;

/// Errors raised by column store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// `create_table` was called for a table that already exists.
    #[snafu(display("Table {table} already exists"))]
    TableExists {
        /// Table name.
        table: String,
    },

    /// The table does not exist.
    #[snafu(display("Table {table} does not exist"))]
    TableNotFound {
        /// Table name.
        table: String,
    },

    /// Table names are restricted to ASCII letters, digits, `_` and `-`.
    #[snafu(display("Invalid table name {name:?}"))]
    InvalidTableName {
        /// The rejected name.
        name: String,
    },

    /// A referenced column is not part of the table.
    #[snafu(display("Table {table} has no column {column}"))]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A row handed to `append_rows` does not match the table schema.
    #[snafu(display("Row {row} does not match the schema of {table}: {details}"))]
    RowShape {
        /// Table name.
        table: String,
        /// Index of the row within the batch.
        row: usize,
        /// What was wrong.
        details: String,
    },

    /// An equality lookup used a value the column cannot be compared with.
    #[snafu(display(
        "Cannot compare column {column} ({column_type}) of {table} with a {kind} value"
    ))]
    PredicateType {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Column type.
        column_type: FieldType,
        /// Kind of the lookup value.
        kind: &'static str,
    },

    /// A stored column has an Arrow type outside the supported set.
    #[snafu(display("Table {table} column {column} has unsupported type {datatype}"))]
    UnsupportedColumnType {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
        /// Arrow type, rendered.
        datatype: String,
    },

    /// A table's manifest is missing data or disagrees with its segments.
    #[snafu(display("Table {table} is corrupt: {details}"))]
    Corrupt {
        /// Table name.
        table: String,
        /// What was inconsistent.
        details: String,
    },

    /// Filesystem failure.
    #[snafu(display("Storage error for table {table}: {source}"))]
    Storage {
        /// Table name.
        table: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The table manifest could not be (de)serialized.
    #[snafu(display("Manifest error for table {table}: {source}"))]
    Manifest {
        /// Table name.
        table: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Parquet encode/decode failure.
    #[snafu(display("Parquet error for table {table}: {source}"))]
    Parquet {
        /// Table name.
        table: String,
        /// Underlying Parquet error.
        source: ParquetError,
    },

    /// Arrow conversion or compute failure.
    #[snafu(display("Arrow error for table {table}: {source}"))]
    Arrow {
        /// Table name.
        table: String,
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// Result type of column store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Typed table storage with batched append and ordered scans.
#[allow(async_fn_in_trait)]
pub trait ColumnStore {
    /// Create `name` with `schema`. Fails with [`StoreError::TableExists`]
    /// if the table is already present.
    async fn create_table(&mut self, name: &str, schema: &RecordSchema) -> StoreResult<()>;

    /// Schema of `name`, or `None` if the table does not exist.
    async fn table_schema(&self, name: &str) -> StoreResult<Option<RecordSchema>>;

    /// Append `rows` (values in schema column order) as one atomic batch.
    /// Returns the number of rows appended.
    async fn append_rows(&mut self, name: &str, rows: &[Vec<FieldValue>]) -> StoreResult<u64>;

    /// All rows, stably sorted ascending by `order_by`.
    async fn scan_ordered(&self, name: &str, order_by: &[&str])
    -> StoreResult<Vec<ProcessedRecord>>;

    /// Rows at positions `[offset, offset + limit)` in storage order,
    /// projected to `columns` (all columns when `None`).
    async fn read_rows(
        &self,
        name: &str,
        offset: u64,
        limit: u64,
        columns: Option<&[String]>,
    ) -> StoreResult<Vec<ProcessedRecord>>;

    /// All rows whose `column` equals `value`, in storage order.
    async fn find_eq(
        &self,
        name: &str,
        column: &str,
        value: &FieldValue,
    ) -> StoreResult<Vec<ProcessedRecord>>;

    /// Number of rows in `name`.
    async fn row_count(&self, name: &str) -> StoreResult<u64>;

    /// Remove `name`. Returns whether it existed.
    async fn drop_table(&mut self, name: &str) -> StoreResult<bool>;

    /// Move table `from` to the unused name `to`, atomically. Readers see
    /// either no `to` table or the complete one.
    async fn rename_table(&mut self, from: &str, to: &str) -> StoreResult<()>;

    /// Names of all tables, sorted.
    async fn list_tables(&self) -> StoreResult<Vec<String>>;
}

/// Reject names that could escape the store root or need quoting.
pub(crate) fn validate_table_name(name: &str) -> StoreResult<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    ensure!(ok, InvalidTableNameSnafu { name });
    Ok(())
}

/// Check arity and value types of a batch before anything is written.
pub(crate) fn check_rows(
    table: &str,
    schema: &RecordSchema,
    rows: &[Vec<FieldValue>],
) -> StoreResult<()> {
    let columns = schema.columns();
    for (row, values) in rows.iter().enumerate() {
        ensure!(
            values.len() == columns.len(),
            RowShapeSnafu {
                table,
                row,
                details: format!("expected {} values, got {}", columns.len(), values.len()),
            }
        );
        for (col, value) in columns.iter().zip(values) {
            let matches = matches!(
                (col.field_type, value),
                (FieldType::Text, FieldValue::Text(_))
                    | (FieldType::Integer, FieldValue::Integer(_))
                    | (FieldType::Real, FieldValue::Real(_))
                    | (FieldType::TextList, FieldValue::TextList(_))
            );
            ensure!(
                matches,
                RowShapeSnafu {
                    table,
                    row,
                    details: format!(
                        "column {} is {}, value is {}",
                        col.name,
                        col.field_type,
                        value.kind()
                    ),
                }
            );
        }
    }
    Ok(())
}

/// Check that an equality lookup compares like with like.
pub(crate) fn check_predicate(
    table: &str,
    schema: &RecordSchema,
    column: &str,
    value: &FieldValue,
) -> StoreResult<usize> {
    let idx = column_index(table, schema, column)?;
    let column_type = schema.columns()[idx].field_type;
    let comparable = matches!(
        (column_type, value),
        (FieldType::Text, FieldValue::Text(_))
            | (FieldType::Integer, FieldValue::Integer(_))
            | (FieldType::Real, FieldValue::Real(_))
    );
    ensure!(
        comparable,
        PredicateTypeSnafu {
            table,
            column,
            column_type,
            kind: value.kind(),
        }
    );
    Ok(idx)
}

pub(crate) fn column_index(
    table: &str,
    schema: &RecordSchema,
    column: &str,
) -> StoreResult<usize> {
    schema
        .index_of(column)
        .context(UnknownColumnSnafu { table, column })
}

/// Stable sort of full-width records by the named columns.
pub(crate) fn sort_records(
    table: &str,
    schema: &RecordSchema,
    records: &mut [ProcessedRecord],
    order_by: &[&str],
) -> StoreResult<()> {
    let keys = order_by
        .iter()
        .map(|c| column_index(table, schema, c))
        .collect::<StoreResult<Vec<_>>>()?;

    records.sort_by(|a, b| {
        keys.iter()
            .map(|&i| match (a.value_at(i), b.value_at(i)) {
                (Some(x), Some(y)) => x.total_cmp(y),
                _ => Ordering::Equal,
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    Ok(())
}

/// Restrict a record to `columns`, in the requested order.
pub(crate) fn project(record: ProcessedRecord, columns: &[String]) -> ProcessedRecord {
    let mut fields = record.into_fields();
    columns
        .iter()
        .filter_map(|name| {
            let pos = fields.iter().position(|(n, _)| n == name)?;
            Some(fields.swap_remove(pos))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            ColumnSpec::new("k", FieldType::Integer),
            ColumnSpec::new("name", FieldType::Text),
        ])
        .expect("schema")
    }

    #[test]
    fn table_names_are_restricted() {
        assert!(validate_table_name("videos_vst_4_mst_4").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("../etc").is_err());
        assert!(validate_table_name("a; DROP TABLE b").is_err());
    }

    #[test]
    fn check_rows_rejects_arity_and_type_errors() {
        let s = schema();
        let ok = vec![vec![FieldValue::Integer(1), FieldValue::from("a")]];
        assert!(check_rows("t", &s, &ok).is_ok());

        let short = vec![vec![FieldValue::Integer(1)]];
        assert!(matches!(
            check_rows("t", &s, &short),
            Err(StoreError::RowShape { row: 0, .. })
        ));

        let typed = vec![ok[0].clone(), vec![FieldValue::from("x"), FieldValue::from("a")]];
        assert!(matches!(
            check_rows("t", &s, &typed),
            Err(StoreError::RowShape { row: 1, .. })
        ));
    }

    #[test]
    fn sort_is_stable_for_equal_keys() {
        let s = schema();
        let mut rows: Vec<ProcessedRecord> = [(2, "a"), (1, "z"), (2, "b"), (1, "y")]
            .into_iter()
            .map(|(k, n)| ProcessedRecord::new().with("k", k as i64).with("name", n))
            .collect();

        sort_records("t", &s, &mut rows, &["k"]).expect("sort");
        let names: Vec<&str> = rows
            .iter()
            .filter_map(|r| r.get("name").and_then(FieldValue::as_text))
            .collect();
        assert_eq!(names, vec!["z", "y", "a", "b"]);

        let err = sort_records("t", &s, &mut rows, &["missing"]).unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { column, .. } if column == "missing"));
    }

    #[test]
    fn project_keeps_requested_order() {
        let r = ProcessedRecord::new()
            .with("a", 1i64)
            .with("b", 2i64)
            .with("c", 3i64);
        let p = project(r, &["c".to_string(), "a".to_string()]);
        assert_eq!(p.names().collect::<Vec<_>>(), vec!["c", "a"]);
    }

    #[test]
    fn predicates_must_match_column_type() {
        let s = schema();
        assert_eq!(check_predicate("t", &s, "k", &FieldValue::Integer(3)).ok(), Some(0));
        assert!(matches!(
            check_predicate("t", &s, "k", &FieldValue::from("3")),
            Err(StoreError::PredicateType { .. })
        ));
    }
}
