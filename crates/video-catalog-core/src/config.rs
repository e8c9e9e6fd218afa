//! Run configuration.
//!
//! A [`RunConfig`] is plain data, usually loaded from JSON. Every field has a
//! default, so `{}` is a valid configuration. [`RunConfig::validate`] checks
//! the whole thing up front; the derived names (tables, bucket field) are
//! only meaningful for a validated configuration.
use std::{
    fs, io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    bucket::{BucketError, BucketStrides},
    probe::DecoderConfig,
    record::{DEFAULT_BUCKET_PREFIX, FieldManifest, ManifestError},
    storage::StoreLocation,
};

/// Errors raised while loading or validating a [`RunConfig`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[snafu(display("Cannot read config {}: {source}", path.display()))]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The configuration is not valid JSON for [`RunConfig`].
    #[snafu(display("Cannot parse config {origin}: {source}"))]
    Parse {
        /// Where the JSON came from.
        origin: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// `workers` was zero.
    #[snafu(display("workers must be >= 1"))]
    NoWorkers,

    /// A stride was zero.
    #[snafu(display("Invalid strides: {source}"))]
    Strides {
        /// Underlying stride error.
        source: BucketError,
    },

    /// A name prefix is empty or contains characters not allowed in table
    /// and field names.
    #[snafu(display(
        "{which} {value:?} must be non-empty and use only ASCII letters, digits, '_' or '-'"
    ))]
    InvalidPrefix {
        /// Which prefix (`table_prefix` or `bucket_prefix`).
        which: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The pass-through field list collides with derived fields.
    #[snafu(display("Invalid pass-through fields: {source}"))]
    Passthrough {
        /// Underlying manifest error.
        source: ManifestError,
    },

    /// `probe_timeout_ms` was zero.
    #[snafu(display("probe_timeout_ms must be >= 1 when set"))]
    ZeroTimeout,
}

/// What a worker does with an entry whose probe failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailurePolicy {
    /// Log the failure and drop the entry.
    #[default]
    Skip,
    /// Log the failure and keep the entry with declared metadata, zero
    /// frames, and an unbucketed bucket value.
    Fallback,
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Parameters of one catalog run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Number of parallel workers (and at most this many chunks).
    pub workers: usize,
    /// Temporal stride of the encoder.
    pub vae_stride: u32,
    /// Temporal downsampling factor of the model.
    pub model_stride: u32,
    /// Root directory of the column store.
    pub store_root: PathBuf,
    /// Prefix of the staging and indexed table names.
    pub table_prefix: String,
    /// Prefix of the bucket field name.
    pub bucket_prefix: String,
    /// Failure log location. Truncated at the start of every run.
    pub failure_log: PathBuf,
    /// Catalog keys copied verbatim into every record.
    pub passthrough_fields: Vec<String>,
    /// Handling of entries whose probe failed.
    pub probe_failure_policy: ProbeFailurePolicy,
    /// Per-item probe time limit in milliseconds. No limit when unset.
    pub probe_timeout_ms: Option<u64>,
    /// `ffprobe` binary to use instead of the one on `PATH`.
    pub ffprobe_bin: Option<PathBuf>,
    /// Have `ffprobe` decode every frame when the container does not record
    /// a frame count (mkv, webm).
    pub count_frames: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            vae_stride: 4,
            model_stride: 4,
            store_root: PathBuf::from("video_catalog"),
            table_prefix: "videos".to_string(),
            bucket_prefix: DEFAULT_BUCKET_PREFIX.to_string(),
            failure_log: PathBuf::from("error_video.log"),
            passthrough_fields: Vec::new(),
            probe_failure_policy: ProbeFailurePolicy::Skip,
            probe_timeout_ms: None,
            ffprobe_bin: None,
            count_frames: false,
        }
    }
}

fn is_valid_prefix(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl RunConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(json: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).context(ParseSnafu { origin })
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).context(ReadSnafu { path })?;
        Self::from_json_str(&json, &path.display().to_string())
    }

    /// Check every field. Called by the pipeline before anything is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(self.workers >= 1, NoWorkersSnafu);
        self.strides()?;
        for (which, value) in [
            ("table_prefix", &self.table_prefix),
            ("bucket_prefix", &self.bucket_prefix),
        ] {
            ensure!(
                is_valid_prefix(value),
                InvalidPrefixSnafu {
                    which,
                    value: value.clone()
                }
            );
        }
        ensure!(self.probe_timeout_ms != Some(0), ZeroTimeoutSnafu);
        self.field_manifest()?;
        Ok(())
    }

    /// The configured stride pair.
    pub fn strides(&self) -> Result<BucketStrides, ConfigError> {
        BucketStrides::new(self.vae_stride, self.model_stride).context(StridesSnafu)
    }

    /// The record layout of this run.
    pub fn field_manifest(&self) -> Result<FieldManifest, ConfigError> {
        FieldManifest::new(
            self.strides()?,
            &self.bucket_prefix,
            self.passthrough_fields.clone(),
        )
        .context(PassthroughSnafu)
    }

    /// Table receiving unsorted chunk output.
    pub fn staging_table(&self) -> String {
        format!(
            "{}_staging_vst_{}_mst_{}",
            self.table_prefix, self.vae_stride, self.model_stride
        )
    }

    /// Final, globally ordered table.
    pub fn indexed_table(&self) -> String {
        format!(
            "{}_vst_{}_mst_{}",
            self.table_prefix, self.vae_stride, self.model_stride
        )
    }

    /// Per-item probe time limit.
    pub fn probe_timeout(&self) -> Option<Duration> {
        self.probe_timeout_ms.map(Duration::from_millis)
    }

    /// Column store root.
    pub fn store_location(&self) -> StoreLocation {
        StoreLocation::local(&self.store_root)
    }

    /// Settings for the `ffprobe` decoder backend.
    pub fn decoder_config(&self) -> DecoderConfig {
        let mut config = DecoderConfig {
            count_frames: self.count_frames,
            ..DecoderConfig::default()
        };
        if let Some(bin) = &self.ffprobe_bin {
            config.ffprobe_bin = bin.clone();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn empty_object_yields_defaults() -> TestResult {
        let config = RunConfig::from_json_str("{}", "inline")?;
        assert_eq!(config.vae_stride, 4);
        assert_eq!(config.model_stride, 4);
        assert!(config.workers >= 1);
        assert_eq!(config.probe_failure_policy, ProbeFailurePolicy::Skip);
        config.validate()?;

        assert_eq!(config.staging_table(), "videos_staging_vst_4_mst_4");
        assert_eq!(config.indexed_table(), "videos_vst_4_mst_4");
        assert_eq!(config.field_manifest()?.bucket_field(), "cut_frame_vst_4_mst_4");
        Ok(())
    }

    #[test]
    fn names_embed_strides() -> TestResult {
        let config = RunConfig::from_json_str(
            r#"{"vae_stride": 8, "model_stride": 2, "table_prefix": "clips", "bucket_prefix": "bucket_frame"}"#,
            "inline",
        )?;
        config.validate()?;
        assert_eq!(config.indexed_table(), "clips_vst_8_mst_2");
        assert_eq!(config.field_manifest()?.bucket_field(), "bucket_frame_vst_8_mst_2");
        Ok(())
    }

    #[test]
    fn loads_from_file() -> TestResult {
        let mut file = NamedTempFile::new()?;
        write!(
            file,
            r#"{{"workers": 3, "probe_failure_policy": "fallback", "probe_timeout_ms": 1500}}"#
        )?;
        let config = RunConfig::from_json_file(file.path())?;
        assert_eq!(config.workers, 3);
        assert_eq!(config.probe_failure_policy, ProbeFailurePolicy::Fallback);
        assert_eq!(config.probe_timeout(), Some(Duration::from_millis(1500)));
        Ok(())
    }

    #[test]
    fn decoder_settings_come_from_the_run_config() -> TestResult {
        let config = RunConfig::from_json_str(
            r#"{"ffprobe_bin": "/opt/ffmpeg/bin/ffprobe", "count_frames": true}"#,
            "inline",
        )?;
        let decoder = config.decoder_config();
        assert_eq!(decoder.ffprobe_bin, PathBuf::from("/opt/ffmpeg/bin/ffprobe"));
        assert!(decoder.count_frames);
        assert!(!RunConfig::default().decoder_config().count_frames);
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_values() {
        let base = RunConfig::default();

        let config = RunConfig { workers: 0, ..base.clone() };
        assert!(matches!(config.validate(), Err(ConfigError::NoWorkers)));

        let config = RunConfig { vae_stride: 0, ..base.clone() };
        assert!(matches!(config.validate(), Err(ConfigError::Strides { .. })));

        let config = RunConfig { table_prefix: "a/b".into(), ..base.clone() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPrefix { which: "table_prefix", .. })
        ));

        let config = RunConfig { bucket_prefix: String::new(), ..base.clone() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPrefix { which: "bucket_prefix", .. })
        ));

        let config = RunConfig { passthrough_fields: vec!["nframes".into()], ..base.clone() };
        assert!(matches!(config.validate(), Err(ConfigError::Passthrough { .. })));

        let config = RunConfig { probe_timeout_ms: Some(0), ..base };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = RunConfig::from_json_str(r#"{"wokers": 2}"#, "inline").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
