//! Catalog input model.
//!
//! A catalog is a JSON array of objects, each describing one video:
//!
//! ```json
//! [{"path": "/data/a.mp4", "cap": ["a cat"], "resolution": {"width": 640, "height": 360},
//!   "fps": 30.0, "duration": 4.2, "aesthetic": 5.1}]
//! ```
//!
//! `path`, `cap` and `resolution` are required; `fps` and `duration` are
//! optional declared values; every other key is kept verbatim in
//! [`CatalogEntry::extra`] so a run can pass it through to the output table.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;

/// Errors raised while loading a catalog file.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[snafu(display("Failed to read catalog {path}: {source}"))]
    Read {
        /// Path of the catalog file.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The catalog file is not a JSON array of catalog entries.
    #[snafu(display("Failed to parse catalog {path}: {source}"))]
    Parse {
        /// Path of the catalog file.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

/// Declared pixel dimensions of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels.
    pub width: i64,
    /// Height in pixels.
    pub height: i64,
}

/// One input record of the catalog. Read-only for the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Location of the video file.
    pub path: String,
    /// Ordered captions for the video.
    #[serde(rename = "cap", default)]
    pub captions: Vec<String>,
    /// Resolution as declared by the catalog (not probed).
    #[serde(rename = "resolution")]
    pub declared_resolution: Resolution,
    /// Frame rate as declared by the catalog.
    #[serde(rename = "fps", default, skip_serializing_if = "Option::is_none")]
    pub declared_fps: Option<f64>,
    /// Duration in seconds as declared by the catalog.
    #[serde(rename = "duration", default, skip_serializing_if = "Option::is_none")]
    pub declared_duration: Option<f64>,
    /// Any further keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogEntry {
    /// Build an entry with only the required fields set.
    pub fn new(path: impl Into<String>, captions: Vec<String>, width: i64, height: i64) -> Self {
        Self {
            path: path.into(),
            captions,
            declared_resolution: Resolution { width, height },
            declared_fps: None,
            declared_duration: None,
            extra: Map::new(),
        }
    }

    /// Last `/`-separated segment of the path.
    pub fn filename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Parse a catalog from a JSON string.
pub fn parse_catalog(json: &str, origin: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    serde_json::from_str(json).context(ParseSnafu { path: origin })
}

/// Read and parse a catalog file, preserving entry order.
pub async fn load_catalog(path: &Path) -> Result<Vec<CatalogEntry>, CatalogError> {
    let display = path.display().to_string();
    let json = tokio::fs::read_to_string(path)
        .await
        .context(ReadSnafu {
            path: display.clone(),
        })?;
    let entries = parse_catalog(&json, &display)?;
    log::info!("loaded {} catalog entries from {display}", entries.len());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_optional_and_extra_fields() {
        let json = r#"[
            {"path": "/v/a.mp4", "cap": ["one", "two"], "resolution": {"width": 640, "height": 360},
             "fps": 24.0, "aesthetic": 5.5},
            {"path": "b.mp4", "cap": [], "resolution": {"width": 1, "height": 2}, "duration": 3.0}
        ]"#;

        let entries = parse_catalog(json, "inline").expect("valid catalog");
        assert_eq!(entries.len(), 2);

        let a = &entries[0];
        assert_eq!(a.filename(), "a.mp4");
        assert_eq!(a.captions, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(a.declared_resolution, Resolution { width: 640, height: 360 });
        assert_eq!(a.declared_fps, Some(24.0));
        assert_eq!(a.declared_duration, None);
        assert_eq!(a.extra.get("aesthetic"), Some(&serde_json::json!(5.5)));

        let b = &entries[1];
        assert_eq!(b.filename(), "b.mp4");
        assert_eq!(b.declared_duration, Some(3.0));
        assert!(b.extra.is_empty());
    }

    #[test]
    fn missing_path_is_a_parse_error() {
        let err = parse_catalog(r#"[{"cap": []}]"#, "inline").unwrap_err();
        assert!(matches!(err, CatalogError::Parse { path, .. } if path == "inline"));
    }

    #[tokio::test]
    async fn load_catalog_reports_missing_file() {
        let err = load_catalog(Path::new("/definitely/not/here.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Read { .. }));
    }
}
