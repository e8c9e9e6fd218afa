//! Lazy, read-only access to an indexed table.
//!
//! A [`CatalogReader`] owns a store handle for its lifetime; after
//! [`CatalogReader::close`] every call fails with [`ReaderError::Closed`].
//! Rows are addressed by their 1-based `row_no`.
//!
//! [`Entity`] is a per-row handle with its own field cache. The first access
//! to a field reads it from the store, later accesses are served from the
//! cache. The cache lives exactly as long as the handle and is never shared.
//!
//! Values are decoded on the way out:
//! - byte strings become text,
//! - the caption field is parsed from its JSON list form into a text list,
//! - everything else is returned as stored.
use std::{collections::HashMap, string::FromUtf8Error};

use snafu::prelude::*;

use crate::{
    column_store::{ColumnStore, StoreError},
    record::{CAPTIONS, FieldValue, ProcessedRecord, ROW_NO},
    schema::{FieldType, RecordSchema},
};

/// Errors raised by [`CatalogReader`] and [`Entity`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReaderError {
    /// The reader was closed.
    #[snafu(display("Reader for {table} is closed"))]
    Closed {
        /// Table the reader was opened on.
        table: String,
    },

    /// The table does not exist or has no `row_no` column.
    #[snafu(display("Table {table} is not an indexed table"))]
    NotIndexed {
        /// Table name.
        table: String,
    },

    /// `row_no` is outside `1..=len`.
    #[snafu(display("Row {row_no} is out of range (table has {len} rows)"))]
    RowOutOfRange {
        /// Requested row.
        row_no: u64,
        /// Number of rows.
        len: u64,
    },

    /// A slice is not within `[1, len + 1]` or has `start > end`.
    #[snafu(display("Invalid slice [{start}, {end}) for a table of {len} rows"))]
    InvalidSlice {
        /// Slice start.
        start: u64,
        /// Slice end (exclusive).
        end: u64,
        /// Number of rows.
        len: u64,
    },

    /// The store returned no data for a row that should exist.
    #[snafu(display("Row {row_no} of {table} could not be read"))]
    RowMissing {
        /// Table name.
        table: String,
        /// Requested row.
        row_no: u64,
    },

    /// A stored byte string is not UTF-8.
    #[snafu(display("Field {field} is not valid UTF-8: {source}"))]
    InvalidUtf8 {
        /// Field name.
        field: String,
        /// Underlying conversion error.
        source: FromUtf8Error,
    },

    /// The caption field does not hold a JSON list of strings.
    #[snafu(display("Field {field} is not a JSON list of strings: {source}"))]
    CaptionDecode {
        /// Field name.
        field: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// The store rejected a read.
    #[snafu(display("Store error while reading {table}: {source}"))]
    Store {
        /// Table name.
        table: String,
        /// Underlying store error.
        source: StoreError,
    },
}

type ReaderResult<T> = Result<T, ReaderError>;

fn decode_value(field: &str, value: FieldValue) -> ReaderResult<FieldValue> {
    let value = match value {
        FieldValue::Bytes(bytes) => {
            FieldValue::Text(String::from_utf8(bytes).context(InvalidUtf8Snafu { field })?)
        }
        other => other,
    };
    match value {
        FieldValue::Text(text) if field == CAPTIONS => {
            let captions: Vec<String> =
                serde_json::from_str(&text).context(CaptionDecodeSnafu { field })?;
            Ok(FieldValue::TextList(captions))
        }
        other => Ok(other),
    }
}

fn decode_record(record: ProcessedRecord) -> ReaderResult<ProcessedRecord> {
    record
        .into_fields()
        .into_iter()
        .map(|(name, value)| {
            let value = decode_value(&name, value)?;
            Ok((name, value))
        })
        .collect()
}

/// Read-only accessor over one indexed table.
#[derive(Debug)]
pub struct CatalogReader<S> {
    store: Option<S>,
    table: String,
    schema: RecordSchema,
}

impl<S: ColumnStore> CatalogReader<S> {
    /// Open `table` in `store`. The table must carry a `row_no` column.
    pub async fn open(store: S, table: impl Into<String>) -> ReaderResult<Self> {
        let table = table.into();
        let schema = store
            .table_schema(&table)
            .await
            .context(StoreSnafu { table: &table })?
            .filter(|s| s.column(ROW_NO).is_some())
            .context(NotIndexedSnafu { table: &table })?;

        Ok(Self {
            store: Some(store),
            table,
            schema,
        })
    }

    /// Table being read.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Borrow the underlying store.
    pub fn store(&self) -> ReaderResult<&S> {
        self.store.as_ref().context(ClosedSnafu {
            table: &self.table,
        })
    }

    /// Release the store handle and return it. Later calls fail.
    pub fn close(&mut self) -> Option<S> {
        self.store.take()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.store.is_none()
    }

    /// Number of rows.
    pub async fn len(&self) -> ReaderResult<u64> {
        self.store()?
            .row_count(&self.table)
            .await
            .context(StoreSnafu { table: &self.table })
    }

    /// Whether the table has no rows.
    pub async fn is_empty(&self) -> ReaderResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Column names and types, in table order.
    pub fn column_names(&self) -> ReaderResult<Vec<(String, FieldType)>> {
        self.store()?;
        Ok(self.schema.type_tags())
    }

    async fn check_row(&self, row_no: u64) -> ReaderResult<()> {
        let len = self.len().await?;
        ensure!(
            (1..=len).contains(&row_no),
            RowOutOfRangeSnafu { row_no, len }
        );
        Ok(())
    }

    async fn read_row(
        &self,
        row_no: u64,
        columns: Option<&[String]>,
    ) -> ReaderResult<ProcessedRecord> {
        let mut rows = self
            .store()?
            .read_rows(&self.table, row_no - 1, 1, columns)
            .await
            .context(StoreSnafu { table: &self.table })?;
        let row = rows.pop().context(RowMissingSnafu {
            table: &self.table,
            row_no,
        })?;
        decode_record(row)
    }

    /// A lazy handle on row `row_no`. Nothing is read until a field is
    /// requested.
    pub async fn entity(&self, row_no: u64) -> ReaderResult<Entity<'_, S>> {
        self.check_row(row_no).await?;
        Ok(Entity {
            reader: self,
            row_no,
            cache: HashMap::new(),
        })
    }

    /// Every field of row `row_no`.
    pub async fn get_entity(&self, row_no: u64) -> ReaderResult<ProcessedRecord> {
        self.entity(row_no).await?.get_entity().await
    }

    /// The named fields of row `row_no`, in the requested order.
    pub async fn get_fields(
        &self,
        row_no: u64,
        names: &[String],
    ) -> ReaderResult<ProcessedRecord> {
        self.entity(row_no).await?.get_fields(names).await
    }

    /// Rows `start..end` (half-open, by `row_no`).
    pub async fn get_slice(&self, start: u64, end: u64) -> ReaderResult<Vec<ProcessedRecord>> {
        let len = self.len().await?;
        ensure!(
            start >= 1 && start <= end && end <= len + 1,
            InvalidSliceSnafu { start, end, len }
        );
        if start == end {
            return Ok(Vec::new());
        }

        self.store()?
            .read_rows(&self.table, start - 1, end - start, None)
            .await
            .context(StoreSnafu { table: &self.table })?
            .into_iter()
            .map(decode_record)
            .collect()
    }

    /// All rows whose `field` equals `value`, or `None` when nothing matches.
    pub async fn get_by_key(
        &self,
        field: &str,
        value: &FieldValue,
    ) -> ReaderResult<Option<Vec<ProcessedRecord>>> {
        let rows = self
            .store()?
            .find_eq(&self.table, field, value)
            .await
            .context(StoreSnafu { table: &self.table })?;
        if rows.is_empty() {
            return Ok(None);
        }
        rows.into_iter()
            .map(decode_record)
            .collect::<ReaderResult<Vec<_>>>()
            .map(Some)
    }

    /// Every row, in `row_no` order.
    pub async fn all(&self) -> ReaderResult<Vec<ProcessedRecord>> {
        let len = self.len().await?;
        self.get_slice(1, len + 1).await
    }
}

/// Lazily loaded view of one row.
#[derive(Debug)]
pub struct Entity<'r, S> {
    reader: &'r CatalogReader<S>,
    row_no: u64,
    cache: HashMap<String, FieldValue>,
}

impl<S: ColumnStore> Entity<'_, S> {
    /// Row this handle points at.
    pub fn row_no(&self) -> u64 {
        self.row_no
    }

    /// Cached value of `name`, without touching the store.
    pub fn cached(&self, name: &str) -> Option<&FieldValue> {
        self.cache.get(name)
    }

    async fn load(&mut self, names: &[String]) -> ReaderResult<()> {
        let missing: Vec<String> = names
            .iter()
            .filter(|n| !self.cache.contains_key(n.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let row = self.reader.read_row(self.row_no, Some(missing.as_slice())).await?;
        self.cache.extend(row.into_fields());
        Ok(())
    }

    fn from_cache(&self, names: &[String]) -> ProcessedRecord {
        names
            .iter()
            .filter_map(|n| self.cache.get(n).map(|v| (n.clone(), v.clone())))
            .collect()
    }

    /// One field, read on first access.
    pub async fn get_field(&mut self, name: &str) -> ReaderResult<FieldValue> {
        let names = [name.to_string()];
        self.load(&names).await?;
        self.cache
            .get(name)
            .cloned()
            .context(RowMissingSnafu {
                table: self.reader.table(),
                row_no: self.row_no,
            })
    }

    /// Several fields, in the requested order. Only uncached ones are read.
    pub async fn get_fields(&mut self, names: &[String]) -> ReaderResult<ProcessedRecord> {
        self.load(names).await?;
        Ok(self.from_cache(names))
    }

    /// Every field of the row, in table order. Fills the cache.
    pub async fn get_entity(&mut self) -> ReaderResult<ProcessedRecord> {
        let names: Vec<String> = self
            .reader
            .schema
            .columns()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        self.get_fields(&names).await
    }
}
