//! Batched, schema-checked appends into one table.
//!
//! The first record ever appended fixes the table schema (see
//! [`crate::schema::infer`]). Each `append` is all-or-nothing: every record
//! is conformed before the store is touched, and the store commits the batch
//! atomically.
use snafu::prelude::*;

use crate::{
    column_store::{ColumnStore, StoreError},
    record::{PATH, ProcessedRecord},
    schema::{self, RecordSchema, SchemaError},
};

/// Errors raised by [`Writer`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WriteError {
    /// No schema could be inferred from the first record.
    #[snafu(display("Cannot infer a schema for {table}: {source}"))]
    Infer {
        /// Target table.
        table: String,
        /// Underlying schema error.
        source: SchemaError,
    },

    /// A record in the batch does not match the table schema. Nothing from
    /// the batch was written.
    #[snafu(display("Record {index} ({path}) does not match the schema of {table}: {source}"))]
    Conform {
        /// Target table.
        table: String,
        /// Position of the record in the batch.
        index: usize,
        /// The record's `path`, if it has one.
        path: String,
        /// Underlying schema error.
        source: SchemaError,
    },

    /// The table exists with a different schema.
    #[snafu(display("Table {table} exists with schema {existing}, requested {requested}"))]
    SchemaConflict {
        /// Target table.
        table: String,
        /// Existing column layout.
        existing: String,
        /// Requested column layout.
        requested: String,
    },

    /// The store rejected the operation.
    #[snafu(display("Store error while writing {table}: {source}"))]
    Store {
        /// Target table.
        table: String,
        /// Underlying store error.
        source: StoreError,
    },
}

fn describe(schema: &RecordSchema) -> String {
    let cols: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| format!("{} {}", c.name, c.field_type))
        .collect();
    format!("({})", cols.join(", "))
}

/// Appends records to one table of a [`ColumnStore`].
pub struct Writer<'a, S> {
    store: &'a mut S,
    table: String,
    schema: Option<RecordSchema>,
}

impl<'a, S: ColumnStore> Writer<'a, S> {
    /// Writer for `table`. The table need not exist yet.
    pub fn new(store: &'a mut S, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            schema: None,
        }
    }

    /// Target table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Schema in effect, once known.
    pub fn schema(&self) -> Option<&RecordSchema> {
        self.schema.as_ref()
    }

    /// Create the table unless it already exists with exactly `schema`.
    ///
    /// Calling this again with the same schema leaves existing rows alone.
    pub async fn create_table_if_absent(&mut self, schema: &RecordSchema) -> Result<(), WriteError> {
        let table = self.table.as_str();
        let existing = self
            .store
            .table_schema(table)
            .await
            .context(StoreSnafu { table })?;

        match existing {
            Some(existing) if &existing == schema => {}
            Some(existing) => {
                return SchemaConflictSnafu {
                    table,
                    existing: describe(&existing),
                    requested: describe(schema),
                }
                .fail();
            }
            None => {
                self.store
                    .create_table(table, schema)
                    .await
                    .context(StoreSnafu { table })?;
                log::info!("created table {table} {}", describe(schema));
            }
        }

        self.schema = Some(schema.clone());
        Ok(())
    }

    async fn resolve_schema(&mut self, first: &ProcessedRecord) -> Result<RecordSchema, WriteError> {
        if let Some(schema) = &self.schema {
            return Ok(schema.clone());
        }

        let table = self.table.as_str();
        let existing = self
            .store
            .table_schema(table)
            .await
            .context(StoreSnafu { table })?;
        let schema = match existing {
            Some(schema) => schema,
            None => schema::infer(first).context(InferSnafu { table })?,
        };
        self.create_table_if_absent(&schema).await?;
        Ok(schema)
    }

    /// Append `records` as one batch. Returns the number of rows written.
    pub async fn append(&mut self, records: &[ProcessedRecord]) -> Result<u64, WriteError> {
        let Some(first) = records.first() else {
            return Ok(0);
        };
        let schema = self.resolve_schema(first).await?;
        let table = self.table.as_str();

        let rows = records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                schema::conform(&schema, record).context(ConformSnafu {
                    table,
                    index,
                    path: record
                        .get(PATH)
                        .and_then(|v| v.as_text())
                        .unwrap_or("<no path>"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let written = self
            .store
            .append_rows(table, &rows)
            .await
            .context(StoreSnafu { table })?;
        log::debug!("appended {written} rows to {table}");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        column_store::MemoryStore,
        record::FieldValue,
        schema::{ColumnSpec, FieldType},
    };

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn record(path: &str, n: i64) -> ProcessedRecord {
        ProcessedRecord::new()
            .with("path", path)
            .with("nframes", n)
            .with("fps", 30.0)
    }

    #[tokio::test]
    async fn first_record_fixes_the_schema() -> TestResult {
        let mut store = MemoryStore::new();
        let mut writer = Writer::new(&mut store, "t");

        assert_eq!(writer.append(&[record("a", 1), record("b", 2)]).await?, 2);
        assert_eq!(
            writer.schema().map(RecordSchema::type_tags),
            Some(vec![
                ("path".to_string(), FieldType::Text),
                ("nframes".to_string(), FieldType::Integer),
                ("fps".to_string(), FieldType::Real),
            ])
        );
        assert_eq!(writer.append(&[]).await?, 0);
        assert_eq!(store.row_count("t").await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn create_table_if_absent_is_idempotent() -> TestResult {
        let mut store = MemoryStore::new();
        let schema = schema::infer(&record("a", 1))?;
        {
            let mut writer = Writer::new(&mut store, "t");
            writer.create_table_if_absent(&schema).await?;
            writer.append(&[record("a", 1)]).await?;
            writer.create_table_if_absent(&schema).await?;
        }
        let mut writer = Writer::new(&mut store, "t");
        writer.create_table_if_absent(&schema).await?;
        drop(writer);
        assert_eq!(store.row_count("t").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_schema_is_rejected() -> TestResult {
        let mut store = MemoryStore::new();
        let mut writer = Writer::new(&mut store, "t");
        writer.append(&[record("a", 1)]).await?;

        let other = RecordSchema::new(vec![ColumnSpec::new("path", FieldType::Text)])?;
        let err = writer.create_table_if_absent(&other).await.unwrap_err();
        assert!(matches!(err, WriteError::SchemaConflict { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn one_bad_record_rejects_the_whole_batch() -> TestResult {
        let mut store = MemoryStore::new();
        let mut writer = Writer::new(&mut store, "t");
        writer.append(&[record("a", 1)]).await?;

        let mut bad = record("c", 3);
        bad.set("fps", FieldValue::from("fast"));
        let err = writer
            .append(&[record("b", 2), bad, record("d", 4)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WriteError::Conform { index: 1, ref path, .. } if path == "c"
        ));
        drop(writer);
        assert_eq!(store.row_count("t").await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_first_record_is_fatal() -> TestResult {
        let mut store = MemoryStore::new();
        let mut writer = Writer::new(&mut store, "t");
        let rec = record("a", 1).with("score", FieldValue::Unsupported(serde_json::Value::Null));

        let err = writer.append(&[rec]).await.unwrap_err();
        assert!(matches!(err, WriteError::Infer { .. }));
        drop(writer);
        assert!(store.list_tables().await?.is_empty());
        Ok(())
    }
}
