//! In-process column store.
//!
//! Holds rows as typed values in insertion order. Useful for tests and for
//! runs whose output does not need to outlive the process.
use std::collections::BTreeMap;

use snafu::prelude::*;

use crate::{
    column_store::{
        ColumnStore, StoreResult, TableExistsSnafu, TableNotFoundSnafu, check_predicate,
        check_rows, column_index, project, sort_records, validate_table_name,
    },
    record::{FieldValue, ProcessedRecord},
    schema::RecordSchema,
};

#[derive(Debug, Clone)]
struct MemTable {
    schema: RecordSchema,
    rows: Vec<Vec<FieldValue>>,
}

impl MemTable {
    fn record(&self, row: &[FieldValue]) -> ProcessedRecord {
        self.schema
            .columns()
            .iter()
            .zip(row)
            .map(|(c, v)| (c.name.clone(), v.clone()))
            .collect()
    }
}

/// A [`ColumnStore`] kept entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: BTreeMap<String, MemTable>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, name: &str) -> StoreResult<&MemTable> {
        validate_table_name(name)?;
        self.tables
            .get(name)
            .context(TableNotFoundSnafu { table: name })
    }
}

impl ColumnStore for MemoryStore {
    async fn create_table(&mut self, name: &str, schema: &RecordSchema) -> StoreResult<()> {
        validate_table_name(name)?;
        ensure!(
            !self.tables.contains_key(name),
            TableExistsSnafu { table: name }
        );
        self.tables.insert(
            name.to_string(),
            MemTable {
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn table_schema(&self, name: &str) -> StoreResult<Option<RecordSchema>> {
        validate_table_name(name)?;
        Ok(self.tables.get(name).map(|t| t.schema.clone()))
    }

    async fn append_rows(&mut self, name: &str, rows: &[Vec<FieldValue>]) -> StoreResult<u64> {
        validate_table_name(name)?;
        let table = self
            .tables
            .get_mut(name)
            .context(TableNotFoundSnafu { table: name })?;
        check_rows(name, &table.schema, rows)?;
        table.rows.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn scan_ordered(
        &self,
        name: &str,
        order_by: &[&str],
    ) -> StoreResult<Vec<ProcessedRecord>> {
        let table = self.table(name)?;
        let mut records: Vec<ProcessedRecord> =
            table.rows.iter().map(|r| table.record(r)).collect();
        sort_records(name, &table.schema, &mut records, order_by)?;
        Ok(records)
    }

    async fn read_rows(
        &self,
        name: &str,
        offset: u64,
        limit: u64,
        columns: Option<&[String]>,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        let table = self.table(name)?;
        if let Some(cols) = columns {
            for c in cols {
                column_index(name, &table.schema, c)?;
            }
        }

        let rows = table
            .rows
            .iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|r| table.record(r));
        Ok(match columns {
            Some(cols) => rows.map(|r| project(r, cols)).collect(),
            None => rows.collect(),
        })
    }

    async fn find_eq(
        &self,
        name: &str,
        column: &str,
        value: &FieldValue,
    ) -> StoreResult<Vec<ProcessedRecord>> {
        let table = self.table(name)?;
        let idx = check_predicate(name, &table.schema, column, value)?;
        Ok(table
            .rows
            .iter()
            .filter(|r| &r[idx] == value)
            .map(|r| table.record(r))
            .collect())
    }

    async fn row_count(&self, name: &str) -> StoreResult<u64> {
        Ok(self.table(name)?.rows.len() as u64)
    }

    async fn drop_table(&mut self, name: &str) -> StoreResult<bool> {
        validate_table_name(name)?;
        Ok(self.tables.remove(name).is_some())
    }

    async fn rename_table(&mut self, from: &str, to: &str) -> StoreResult<()> {
        validate_table_name(from)?;
        validate_table_name(to)?;
        ensure!(!self.tables.contains_key(to), TableExistsSnafu { table: to });
        let table = self
            .tables
            .remove(from)
            .context(TableNotFoundSnafu { table: from })?;
        self.tables.insert(to.to_string(), table);
        Ok(())
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }
}
