//! Column schemas: inference from a record and conformance checks.
//!
//! Rule for a run: **the first successful record fixes the schema**.
//! Column types come from that record's runtime values:
//! - text -> [`FieldType::Text`]
//! - integer -> [`FieldType::Integer`]
//! - real -> [`FieldType::Real`]
//! - list of strings -> [`FieldType::TextList`]
//!
//! Any other value is a fatal [`SchemaError`]. Every later record must have
//! exactly the same fields, in the same order, with values of the column's
//! type. Identifier columns (`path`, `filename`) are always text so they
//! keep lexical ordering; numeric values there are rendered as text.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::record::{FILENAME, FieldValue, PATH, ProcessedRecord};

/// Storable column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// UTF-8 text.
    Text,
    /// 64-bit signed integer.
    Integer,
    /// 64-bit float.
    Real,
    /// List of UTF-8 strings.
    TextList,
}

impl FieldType {
    /// Type tag reported by schema introspection.
    pub fn tag(&self) -> &'static str {
        match self {
            FieldType::Text => "VARCHAR",
            FieldType::Integer => "BIGINT",
            FieldType::Real => "DOUBLE",
            FieldType::TextList => "VARCHAR[]",
        }
    }

    fn of(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Text(_) => Some(FieldType::Text),
            FieldValue::Integer(_) => Some(FieldType::Integer),
            FieldValue::Real(_) => Some(FieldType::Real),
            FieldValue::TextList(_) => Some(FieldType::TextList),
            FieldValue::Bytes(_) | FieldValue::Unsupported(_) => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Column type.
    pub field_type: FieldType,
}

impl ColumnSpec {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered set of columns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordSchema {
    columns: Vec<ColumnSpec>,
}

impl RecordSchema {
    /// Build a schema, rejecting duplicate or empty column names.
    pub fn new(columns: Vec<ColumnSpec>) -> SchemaResult<Self> {
        ensure!(!columns.is_empty(), EmptyRecordSnafu);
        for (i, col) in columns.iter().enumerate() {
            ensure!(!col.name.is_empty(), EmptyFieldNameSnafu { position: i });
            ensure!(
                !columns[..i].iter().any(|c| c.name == col.name),
                DuplicateFieldSnafu {
                    field: col.name.clone()
                }
            );
        }
        Ok(Self { columns })
    }

    /// Columns in order.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Look a column up by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a column.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Copy of this schema with `column` appended.
    pub fn with_column(&self, column: ColumnSpec) -> SchemaResult<Self> {
        let mut columns = self.columns.clone();
        columns.push(column);
        Self::new(columns)
    }

    /// `name -> type` pairs in column order.
    pub fn type_tags(&self) -> Vec<(String, FieldType)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.field_type))
            .collect()
    }
}

/// Errors raised by schema inference and conformance checks.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// A record with no fields cannot define a table.
    #[snafu(display("cannot infer a schema from a record with no fields"))]
    EmptyRecord,

    /// A column name is empty.
    #[snafu(display("field at position {position} has an empty name"))]
    EmptyFieldName {
        /// Position of the field.
        position: usize,
    },

    /// Two fields share a name.
    #[snafu(display("field {field} appears more than once"))]
    DuplicateField {
        /// The repeated name.
        field: String,
    },

    /// A value is outside the storable kinds.
    #[snafu(display("field {field} holds a {kind} value, which no column type can store"))]
    UnsupportedValue {
        /// Field name.
        field: String,
        /// Kind of the offending value.
        kind: &'static str,
    },

    /// A record lacks a schema column.
    #[snafu(display("record is missing column {column}"))]
    MissingField {
        /// The missing column.
        column: String,
    },

    /// A record has a field the schema does not know.
    #[snafu(display("record has extra field {field} not present in the table schema"))]
    ExtraField {
        /// The unexpected field.
        field: String,
    },

    /// A record's fields are in a different order than the schema's.
    #[snafu(display("record field {position} is {found}, table schema expects {expected}"))]
    FieldOrder {
        /// Position of the first mismatch.
        position: usize,
        /// Column expected at that position.
        expected: String,
        /// Field found at that position.
        found: String,
    },

    /// A value does not match its column's type.
    #[snafu(display("type mismatch for column {column}: table has {expected}, record has {found}"))]
    TypeMismatch {
        /// Column name.
        column: String,
        /// Column type.
        expected: FieldType,
        /// Kind of the record's value.
        found: &'static str,
    },
}

/// Convenience alias for schema results.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Whether `name` is an identifier column that must stay text.
pub fn is_identifier_field(name: &str) -> bool {
    name == PATH || name == FILENAME
}

/// Derive the table schema from the first record of a run.
pub fn infer(record: &ProcessedRecord) -> SchemaResult<RecordSchema> {
    let columns = record
        .iter()
        .map(|(name, value)| {
            let field_type = match (FieldType::of(value), value) {
                (Some(FieldType::Integer | FieldType::Real), _) if is_identifier_field(name) => {
                    FieldType::Text
                }
                (Some(t), _) => t,
                (None, v) => {
                    return UnsupportedValueSnafu {
                        field: name,
                        kind: v.kind(),
                    }
                    .fail();
                }
            };
            Ok(ColumnSpec::new(name, field_type))
        })
        .collect::<SchemaResult<Vec<_>>>()?;

    RecordSchema::new(columns)
}

/// Check `record` against `schema` and return the values to store, in
/// column order. Identifier columns accept numbers, rendered as text.
pub fn conform(schema: &RecordSchema, record: &ProcessedRecord) -> SchemaResult<Vec<FieldValue>> {
    let mut out = Vec::with_capacity(schema.columns().len());
    let mut fields = record.iter();

    for (position, col) in schema.columns().iter().enumerate() {
        let Some((name, value)) = fields.next() else {
            return MissingFieldSnafu {
                column: col.name.clone(),
            }
            .fail();
        };

        if name != col.name {
            if record.get(&col.name).is_none() {
                return MissingFieldSnafu {
                    column: col.name.clone(),
                }
                .fail();
            }
            if schema.column(name).is_none() {
                return ExtraFieldSnafu { field: name }.fail();
            }
            return FieldOrderSnafu {
                position,
                expected: col.name.clone(),
                found: name,
            }
            .fail();
        }

        let stored = match (col.field_type, value) {
            (FieldType::Text, FieldValue::Text(_))
            | (FieldType::Integer, FieldValue::Integer(_))
            | (FieldType::Real, FieldValue::Real(_))
            | (FieldType::TextList, FieldValue::TextList(_)) => value.clone(),
            (FieldType::Text, FieldValue::Integer(i)) if is_identifier_field(name) => {
                FieldValue::Text(i.to_string())
            }
            (FieldType::Text, FieldValue::Real(f)) if is_identifier_field(name) => {
                FieldValue::Text(f.to_string())
            }
            (expected, other) => {
                return TypeMismatchSnafu {
                    column: col.name.clone(),
                    expected,
                    found: other.kind(),
                }
                .fail();
            }
        };
        out.push(stored);
    }

    if let Some((name, _)) = fields.next() {
        return ExtraFieldSnafu { field: name }.fail();
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record() -> ProcessedRecord {
        ProcessedRecord::new()
            .with("path", "/a/b.mp4")
            .with("nframes", 40i64)
            .with("fps", 30.0)
            .with("tags", vec!["x".to_string()])
    }

    #[test]
    fn infers_types_from_values() {
        let schema = infer(&record()).expect("schema");
        assert_eq!(
            schema.type_tags(),
            vec![
                ("path".to_string(), FieldType::Text),
                ("nframes".to_string(), FieldType::Integer),
                ("fps".to_string(), FieldType::Real),
                ("tags".to_string(), FieldType::TextList),
            ]
        );
    }

    #[test]
    fn identifier_fields_are_forced_to_text() {
        let r = ProcessedRecord::new().with("filename", 12i64).with("n", 1i64);
        let schema = infer(&r).expect("schema");
        assert_eq!(schema.column("filename").map(|c| c.field_type), Some(FieldType::Text));

        let values = conform(&schema, &r).expect("conforms");
        assert_eq!(values[0], FieldValue::from("12"));
    }

    #[test]
    fn unsupported_values_are_fatal() {
        let r = record().with("flag", FieldValue::from_json(&json!(true)));
        assert_eq!(
            infer(&r),
            Err(SchemaError::UnsupportedValue {
                field: "flag".into(),
                kind: "boolean"
            })
        );
    }

    #[test]
    fn empty_and_duplicate_records_are_rejected() {
        assert_eq!(infer(&ProcessedRecord::new()), Err(SchemaError::EmptyRecord));
        let dup = ProcessedRecord::new().with("a", 1i64).with("a", 2i64);
        assert!(matches!(infer(&dup), Err(SchemaError::DuplicateField { .. })));
    }

    #[test]
    fn conform_accepts_identical_layout() {
        let schema = infer(&record()).expect("schema");
        let values = conform(&schema, &record()).expect("conforms");
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn conform_rejects_missing_extra_reordered_and_mistyped() {
        let schema = infer(&record()).expect("schema");

        let missing = ProcessedRecord::new()
            .with("path", "p")
            .with("nframes", 1i64)
            .with("fps", 1.0);
        assert!(matches!(
            conform(&schema, &missing),
            Err(SchemaError::MissingField { column }) if column == "tags"
        ));

        let extra = record().with("more", 1i64);
        assert!(matches!(
            conform(&schema, &extra),
            Err(SchemaError::ExtraField { field }) if field == "more"
        ));

        let reordered = ProcessedRecord::new()
            .with("nframes", 1i64)
            .with("path", "p")
            .with("fps", 1.0)
            .with("tags", Vec::<String>::new());
        assert!(matches!(
            conform(&schema, &reordered),
            Err(SchemaError::FieldOrder { position: 0, .. })
        ));

        let mut mistyped = record();
        mistyped.set("fps", FieldValue::Integer(30));
        assert!(matches!(
            conform(&schema, &mistyped),
            Err(SchemaError::TypeMismatch { column, expected: FieldType::Real, found: "integer" })
                if column == "fps"
        ));
    }
}
