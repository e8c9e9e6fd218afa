//! Processed records and their values.
//!
//! A [`ProcessedRecord`] is an ordered association list of field name to
//! [`FieldValue`]. Its field set is declared per run by a [`FieldManifest`]:
//! the fixed base fields, then any pass-through catalog fields, then the
//! stride-parameterized bucket field. Every record built from one manifest
//! has the same fields in the same order.

use std::cmp::Ordering;

use serde_json::Value;
use snafu::prelude::*;

use crate::{
    bucket::BucketStrides,
    catalog::CatalogEntry,
    probe::VideoFeatures,
};

/// Path of the video.
pub const PATH: &str = "path";
/// Last path segment.
pub const FILENAME: &str = "filename";
/// Captions, stored as a JSON-encoded list.
pub const CAPTIONS: &str = "cap";
/// Probed frame width.
pub const RESOLUTION_WIDTH: &str = "resolution_width";
/// Probed frame height.
pub const RESOLUTION_HEIGHT: &str = "resolution_height";
/// Average frame rate.
pub const FPS: &str = "fps";
/// Duration in seconds.
pub const DURATION: &str = "duration";
/// Frame count.
pub const NFRAMES: &str = "nframes";
/// `height / width`.
pub const ASPECT_RATIO: &str = "aspect_ratio";
/// Dense 1-based rank assigned by the indexer.
pub const ROW_NO: &str = "row_no";

/// Base fields in output order (the bucket field follows any pass-through fields).
pub const BASE_FIELDS: [&str; 9] = [
    PATH,
    FILENAME,
    CAPTIONS,
    RESOLUTION_WIDTH,
    RESOLUTION_HEIGHT,
    FPS,
    DURATION,
    NFRAMES,
    ASPECT_RATIO,
];

/// Default prefix of the bucket field name.
pub const DEFAULT_BUCKET_PREFIX: &str = "cut_frame";

/// A single typed value of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// UTF-8 text.
    Text(String),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// Ordered list of strings.
    TextList(Vec<String>),
    /// Raw bytes, as some stores surface undecoded string columns.
    Bytes(Vec<u8>),
    /// A pass-through value of a kind no column can hold.
    Unsupported(Value),
}

impl FieldValue {
    /// Convert a pass-through JSON value.
    ///
    /// Strings, integers, floats, and arrays of strings map to the storable
    /// kinds; everything else is kept as [`FieldValue::Unsupported`] so schema
    /// inference can reject it by name.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Integer(i),
                None => match n.as_f64() {
                    Some(f) => FieldValue::Real(f),
                    None => FieldValue::Unsupported(value.clone()),
                },
            },
            Value::Array(items) => {
                let strings: Option<Vec<String>> = items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect();
                match strings {
                    Some(list) => FieldValue::TextList(list),
                    None => FieldValue::Unsupported(value.clone()),
                }
            }
            _ => FieldValue::Unsupported(value.clone()),
        }
    }

    /// Short name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Real(_) => "real",
            FieldValue::TextList(_) => "text list",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::Unsupported(Value::Null) => "null",
            FieldValue::Unsupported(Value::Bool(_)) => "boolean",
            FieldValue::Unsupported(Value::Object(_)) => "object",
            FieldValue::Unsupported(Value::Array(_)) => "mixed array",
            FieldValue::Unsupported(_) => "unsupported",
        }
    }

    /// Borrow the text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The integer, if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The float, if this is a real value.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            FieldValue::Real(f) => Some(*f),
            _ => None,
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            FieldValue::Integer(_) => 0,
            FieldValue::Real(_) => 1,
            FieldValue::Text(_) => 2,
            FieldValue::TextList(_) => 3,
            FieldValue::Bytes(_) => 4,
            FieldValue::Unsupported(_) => 5,
        }
    }

    /// Total order used for ordered scans.
    ///
    /// Values of the same kind compare naturally (reals by `total_cmp`, text
    /// byte-wise); values of different kinds compare by kind.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Real(a), FieldValue::Real(b)) => a.total_cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            (FieldValue::TextList(a), FieldValue::TextList(b)) => a.cmp(b),
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a.cmp(b),
            (FieldValue::Unsupported(a), FieldValue::Unsupported(b)) => {
                a.to_string().cmp(&b.to_string())
            }
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Real(f)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        FieldValue::TextList(v)
    }
}

/// An ordered list of named values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessedRecord {
    fields: Vec<(String, FieldValue)>,
}

impl ProcessedRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field. Callers keep names unique.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.push(name, value);
        self
    }

    /// Look a field up by name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Value at `index`, in field order.
    pub fn value_at(&self, index: usize) -> Option<&FieldValue> {
        self.fields.get(index).map(|(_, v)| v)
    }

    /// Replace the value of an existing field, or append it.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Field names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    /// `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Consume into the underlying pairs.
    pub fn into_fields(self) -> Vec<(String, FieldValue)> {
        self.fields
    }
}

impl FromIterator<(String, FieldValue)> for ProcessedRecord {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Errors raised when declaring a field manifest.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum ManifestError {
    /// A pass-through field shadows a derived field.
    #[snafu(display("pass-through field {field} collides with a derived field"))]
    ReservedField {
        /// The offending field name.
        field: String,
    },

    /// A pass-through field is listed twice.
    #[snafu(display("pass-through field {field} is listed more than once"))]
    DuplicateField {
        /// The repeated field name.
        field: String,
    },
}

/// The declared field layout of every record produced in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldManifest {
    passthrough: Vec<String>,
    bucket_field: String,
}

impl FieldManifest {
    /// Declare a manifest for `strides`, with the bucket field named
    /// `<bucket_prefix>_vst_<v>_mst_<m>` and `passthrough` catalog keys copied
    /// between the base fields and the bucket field.
    pub fn new(
        strides: BucketStrides,
        bucket_prefix: &str,
        passthrough: Vec<String>,
    ) -> Result<Self, ManifestError> {
        let bucket_field = strides.field_name(bucket_prefix);
        for (i, field) in passthrough.iter().enumerate() {
            ensure!(
                !BASE_FIELDS.contains(&field.as_str()) && *field != bucket_field && field != ROW_NO,
                ReservedFieldSnafu {
                    field: field.clone()
                }
            );
            ensure!(
                !passthrough[..i].contains(field),
                DuplicateFieldSnafu {
                    field: field.clone()
                }
            );
        }
        Ok(Self {
            passthrough,
            bucket_field,
        })
    }

    /// Name of the bucket field.
    pub fn bucket_field(&self) -> &str {
        &self.bucket_field
    }

    /// Pass-through catalog keys, in output order.
    pub fn passthrough(&self) -> &[String] {
        &self.passthrough
    }

    /// All field names, in output order.
    pub fn field_names(&self) -> Vec<String> {
        BASE_FIELDS
            .iter()
            .map(|s| s.to_string())
            .chain(self.passthrough.iter().cloned())
            .chain(std::iter::once(self.bucket_field.clone()))
            .collect()
    }

    /// Assemble the record for `entry` from its probed features and bucket.
    ///
    /// A pass-through key missing from the entry is recorded as a null
    /// [`FieldValue::Unsupported`], which the writer rejects.
    pub fn build(
        &self,
        entry: &CatalogEntry,
        features: &VideoFeatures,
        bucket: i64,
    ) -> ProcessedRecord {
        let captions =
            serde_json::to_string(&entry.captions).unwrap_or_else(|_| String::from("[]"));

        let mut record = ProcessedRecord::new()
            .with(PATH, entry.path.as_str())
            .with(FILENAME, entry.filename())
            .with(CAPTIONS, captions)
            .with(RESOLUTION_WIDTH, features.width)
            .with(RESOLUTION_HEIGHT, features.height)
            .with(FPS, features.fps)
            .with(DURATION, features.duration)
            .with(NFRAMES, features.nframes)
            .with(ASPECT_RATIO, features.aspect_ratio);

        for key in &self.passthrough {
            let value = entry
                .extra
                .get(key)
                .map(FieldValue::from_json)
                .unwrap_or(FieldValue::Unsupported(Value::Null));
            record.push(key.as_str(), value);
        }

        record.push(self.bucket_field.as_str(), bucket);
        record
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn manifest(passthrough: &[&str]) -> Result<FieldManifest, ManifestError> {
        FieldManifest::new(
            BucketStrides::new(4, 4).expect("strides"),
            DEFAULT_BUCKET_PREFIX,
            passthrough.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn features() -> VideoFeatures {
        VideoFeatures {
            nframes: 40,
            fps: 20.0,
            duration: 2.0,
            width: 100,
            height: 50,
            aspect_ratio: 0.5,
        }
    }

    #[test]
    fn build_follows_manifest_order() {
        let m = manifest(&["aesthetic"]).expect("manifest");
        let mut entry = CatalogEntry::new("/data/clip.mp4", vec!["hi".into()], 1, 1);
        entry.extra.insert("aesthetic".into(), json!(4.5));

        let record = m.build(&entry, &features(), 29);
        let names: Vec<&str> = record.names().collect();
        assert_eq!(names, m.field_names().iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(names.last(), Some(&"cut_frame_vst_4_mst_4"));
        assert_eq!(record.get(FILENAME), Some(&FieldValue::from("clip.mp4")));
        assert_eq!(record.get(CAPTIONS), Some(&FieldValue::from(r#"["hi"]"#)));
        assert_eq!(record.get("aesthetic"), Some(&FieldValue::Real(4.5)));
        assert_eq!(record.get("cut_frame_vst_4_mst_4"), Some(&FieldValue::Integer(29)));
    }

    #[test]
    fn missing_passthrough_key_is_null() {
        let m = manifest(&["score"]).expect("manifest");
        let entry = CatalogEntry::new("a.mp4", vec![], 1, 1);
        let record = m.build(&entry, &features(), -1);
        assert_eq!(record.get("score").map(FieldValue::kind), Some("null"));
    }

    #[test]
    fn reserved_and_duplicate_passthrough_fields_are_rejected() {
        assert!(matches!(
            manifest(&["fps"]),
            Err(ManifestError::ReservedField { field }) if field == "fps"
        ));
        assert!(matches!(
            manifest(&["cut_frame_vst_4_mst_4"]),
            Err(ManifestError::ReservedField { .. })
        ));
        assert!(matches!(
            manifest(&["a", "a"]),
            Err(ManifestError::DuplicateField { field }) if field == "a"
        ));
    }

    #[test]
    fn json_values_map_to_closed_kinds() {
        assert_eq!(FieldValue::from_json(&json!("x")), FieldValue::from("x"));
        assert_eq!(FieldValue::from_json(&json!(3)), FieldValue::Integer(3));
        assert_eq!(FieldValue::from_json(&json!(0.25)), FieldValue::Real(0.25));
        assert_eq!(
            FieldValue::from_json(&json!(["a", "b"])),
            FieldValue::TextList(vec!["a".into(), "b".into()])
        );
        assert_eq!(FieldValue::from_json(&json!(true)).kind(), "boolean");
        assert_eq!(FieldValue::from_json(&json!([1, "a"])).kind(), "mixed array");
        assert_eq!(FieldValue::from_json(&json!({"k": 1})).kind(), "object");
    }

    #[test]
    fn total_cmp_orders_within_and_across_kinds() {
        assert_eq!(FieldValue::Integer(-1).total_cmp(&FieldValue::Integer(29)), Ordering::Less);
        assert_eq!(FieldValue::Real(0.5).total_cmp(&FieldValue::Real(0.5)), Ordering::Equal);
        assert_eq!(FieldValue::from("b").total_cmp(&FieldValue::from("a")), Ordering::Greater);
        assert_eq!(FieldValue::Integer(100).total_cmp(&FieldValue::from("0")), Ordering::Less);
    }
}
