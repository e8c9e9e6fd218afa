//! Conversions between rows of [`FieldValue`]s and Arrow record batches.
//!
//! Column types map onto Arrow as:
//! - `Text` -> `Utf8`
//! - `Integer` -> `Int64`
//! - `Real` -> `Float64`
//! - `TextList` -> `List<Utf8>`
//!
//! On the read side a few wider Arrow types are accepted as well, so segments
//! written by other tools still decode. `Binary` columns surface as
//! [`FieldValue::Bytes`]; callers decide how to interpret them.
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, Float32Array, Float64Array, Float64Builder, Int32Array,
    Int64Array, Int64Builder, LargeBinaryArray, LargeStringArray, ListArray, ListBuilder,
    RecordBatch, Scalar, StringArray, StringBuilder,
};
use arrow::compute::filter_record_batch;
use arrow::compute::kernels::cmp as cmp_kernels;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde_json::Value;
use snafu::prelude::*;

use crate::{
    column_store::{ArrowSnafu, RowShapeSnafu, StoreError, StoreResult},
    record::{FieldValue, ProcessedRecord},
    schema::{FieldType, RecordSchema},
};

fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::Text => DataType::Utf8,
        FieldType::Integer => DataType::Int64,
        FieldType::Real => DataType::Float64,
        FieldType::TextList => DataType::List(Arc::new(Field::new_list_field(DataType::Utf8, true))),
    }
}

/// Arrow schema for a table schema. Columns are non-nullable.
pub(crate) fn arrow_schema(schema: &RecordSchema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .columns()
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.field_type), false))
        .collect();
    Arc::new(Schema::new(fields))
}

fn shape_error(table: &str, row: usize, column: &str, value: &FieldValue) -> StoreError {
    RowShapeSnafu {
        table,
        row,
        details: format!("column {column} cannot hold a {} value", value.kind()),
    }
    .build()
}

/// Build one record batch from rows already checked against `schema`.
pub(crate) fn rows_to_batch(
    table: &str,
    schema: &RecordSchema,
    rows: &[Vec<FieldValue>],
) -> StoreResult<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.columns().len());

    for (idx, col) in schema.columns().iter().enumerate() {
        let array: ArrayRef = match col.field_type {
            FieldType::Text => {
                let mut b = StringBuilder::with_capacity(rows.len(), rows.len() * 16);
                for (r, row) in rows.iter().enumerate() {
                    match &row[idx] {
                        FieldValue::Text(s) => b.append_value(s),
                        other => return Err(shape_error(table, r, &col.name, other)),
                    }
                }
                Arc::new(b.finish())
            }
            FieldType::Integer => {
                let mut b = Int64Builder::with_capacity(rows.len());
                for (r, row) in rows.iter().enumerate() {
                    match &row[idx] {
                        FieldValue::Integer(i) => b.append_value(*i),
                        other => return Err(shape_error(table, r, &col.name, other)),
                    }
                }
                Arc::new(b.finish())
            }
            FieldType::Real => {
                let mut b = Float64Builder::with_capacity(rows.len());
                for (r, row) in rows.iter().enumerate() {
                    match &row[idx] {
                        FieldValue::Real(f) => b.append_value(*f),
                        other => return Err(shape_error(table, r, &col.name, other)),
                    }
                }
                Arc::new(b.finish())
            }
            FieldType::TextList => {
                let mut b = ListBuilder::new(StringBuilder::new());
                for (r, row) in rows.iter().enumerate() {
                    match &row[idx] {
                        FieldValue::TextList(items) => {
                            for s in items {
                                b.values().append_value(s);
                            }
                            b.append(true);
                        }
                        other => return Err(shape_error(table, r, &col.name, other)),
                    }
                }
                Arc::new(b.finish())
            }
        };
        columns.push(array);
    }

    RecordBatch::try_new(arrow_schema(schema), columns).context(ArrowSnafu { table })
}

fn downcast<'a, T: 'static>(table: &str, field: &Field, array: &'a ArrayRef) -> StoreResult<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| StoreError::UnsupportedColumnType {
            table: table.to_string(),
            column: field.name().clone(),
            datatype: array.data_type().to_string(),
        })
}

fn collect_values<A: Array, F>(array: &A, mut value: F) -> Vec<FieldValue>
where
    F: FnMut(&A, usize) -> FieldValue,
{
    (0..array.len())
        .map(|i| {
            if array.is_null(i) {
                FieldValue::Unsupported(Value::Null)
            } else {
                value(array, i)
            }
        })
        .collect()
}

fn column_values(table: &str, field: &Field, array: &ArrayRef) -> StoreResult<Vec<FieldValue>> {
    let values = match field.data_type() {
        DataType::Utf8 => collect_values(downcast::<StringArray>(table, field, array)?, |a, i| {
            FieldValue::Text(a.value(i).to_string())
        }),
        DataType::LargeUtf8 => {
            collect_values(downcast::<LargeStringArray>(table, field, array)?, |a, i| {
                FieldValue::Text(a.value(i).to_string())
            })
        }
        DataType::Int64 => collect_values(downcast::<Int64Array>(table, field, array)?, |a, i| {
            FieldValue::Integer(a.value(i))
        }),
        DataType::Int32 => collect_values(downcast::<Int32Array>(table, field, array)?, |a, i| {
            FieldValue::Integer(i64::from(a.value(i)))
        }),
        DataType::Float64 => {
            collect_values(downcast::<Float64Array>(table, field, array)?, |a, i| {
                FieldValue::Real(a.value(i))
            })
        }
        DataType::Float32 => {
            collect_values(downcast::<Float32Array>(table, field, array)?, |a, i| {
                FieldValue::Real(f64::from(a.value(i)))
            })
        }
        DataType::Binary => collect_values(downcast::<BinaryArray>(table, field, array)?, |a, i| {
            FieldValue::Bytes(a.value(i).to_vec())
        }),
        DataType::LargeBinary => {
            collect_values(downcast::<LargeBinaryArray>(table, field, array)?, |a, i| {
                FieldValue::Bytes(a.value(i).to_vec())
            })
        }
        DataType::List(inner) if inner.data_type() == &DataType::Utf8 => {
            let lists = downcast::<ListArray>(table, field, array)?;
            let mut out = Vec::with_capacity(lists.len());
            for i in 0..lists.len() {
                if lists.is_null(i) {
                    out.push(FieldValue::Unsupported(Value::Null));
                    continue;
                }
                let items = lists.value(i);
                let strings = downcast::<StringArray>(table, field, &items)?;
                let list = (0..strings.len())
                    .filter(|&j| !strings.is_null(j))
                    .map(|j| strings.value(j).to_string())
                    .collect();
                out.push(FieldValue::TextList(list));
            }
            out
        }
        other => {
            return Err(StoreError::UnsupportedColumnType {
                table: table.to_string(),
                column: field.name().clone(),
                datatype: other.to_string(),
            });
        }
    };
    Ok(values)
}

/// Decode a batch into records, one field per batch column.
pub(crate) fn batch_to_records(table: &str, batch: &RecordBatch) -> StoreResult<Vec<ProcessedRecord>> {
    let schema = batch.schema();
    let mut records: Vec<ProcessedRecord> =
        (0..batch.num_rows()).map(|_| ProcessedRecord::new()).collect();

    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        let values = column_values(table, field, array)?;
        for (record, value) in records.iter_mut().zip(values) {
            record.push(field.name().as_str(), value);
        }
    }
    Ok(records)
}

/// Keep the rows of `batch` whose column `idx` equals `value`.
///
/// The value is broadcast as a one-element scalar; callers have already
/// checked that its kind matches the column type.
pub(crate) fn filter_eq(
    table: &str,
    batch: &RecordBatch,
    idx: usize,
    value: &FieldValue,
) -> StoreResult<RecordBatch> {
    let col = batch.column(idx);
    let mask = match value {
        FieldValue::Text(s) => cmp_kernels::eq(col, &Scalar::new(StringArray::from(vec![s.as_str()]))),
        FieldValue::Integer(i) => cmp_kernels::eq(col, &Scalar::new(Int64Array::from(vec![*i]))),
        FieldValue::Real(f) => cmp_kernels::eq(col, &Scalar::new(Float64Array::from(vec![*f]))),
        other => {
            return Err(shape_error(table, 0, batch.schema().field(idx).name(), other));
        }
    }
    .context(ArrowSnafu { table })?;

    filter_record_batch(batch, &mask).context(ArrowSnafu { table })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            ColumnSpec::new("path", FieldType::Text),
            ColumnSpec::new("nframes", FieldType::Integer),
            ColumnSpec::new("fps", FieldType::Real),
            ColumnSpec::new("tags", FieldType::TextList),
        ])
        .expect("schema")
    }

    fn rows() -> Vec<Vec<FieldValue>> {
        vec![
            vec![
                FieldValue::from("a.mp4"),
                FieldValue::Integer(40),
                FieldValue::Real(30.0),
                FieldValue::TextList(vec!["x".into(), "y".into()]),
            ],
            vec![
                FieldValue::from("b.mp4"),
                FieldValue::Integer(60),
                FieldValue::Real(25.0),
                FieldValue::TextList(Vec::new()),
            ],
        ]
    }

    #[test]
    fn batch_preserves_values_and_column_order() -> TestResult {
        let batch = rows_to_batch("t", &schema(), &rows())?;
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema(), arrow_schema(&schema()));

        let records = batch_to_records("t", &batch)?;
        assert_eq!(
            records[0].names().collect::<Vec<_>>(),
            vec!["path", "nframes", "fps", "tags"]
        );
        assert_eq!(records[1].get("nframes"), Some(&FieldValue::Integer(60)));
        assert_eq!(
            records[0].get("tags"),
            Some(&FieldValue::TextList(vec!["x".into(), "y".into()]))
        );
        assert_eq!(records[1].get("tags"), Some(&FieldValue::TextList(Vec::new())));
        Ok(())
    }

    #[test]
    fn binary_columns_surface_as_bytes() -> TestResult {
        let schema = Arc::new(Schema::new(vec![Field::new("raw", DataType::Binary, false)]));
        let array: ArrayRef = Arc::new(BinaryArray::from(vec![b"abc".as_slice()]));
        let batch = RecordBatch::try_new(schema, vec![array])?;

        let records = batch_to_records("t", &batch)?;
        assert_eq!(records[0].get("raw"), Some(&FieldValue::Bytes(b"abc".to_vec())));
        Ok(())
    }

    #[test]
    fn filter_eq_keeps_matching_rows() -> TestResult {
        let batch = rows_to_batch("t", &schema(), &rows())?;

        let hit = filter_eq("t", &batch, 0, &FieldValue::from("b.mp4"))?;
        assert_eq!(hit.num_rows(), 1);

        let miss = filter_eq("t", &batch, 1, &FieldValue::Integer(7))?;
        assert_eq!(miss.num_rows(), 0);
        Ok(())
    }
}
