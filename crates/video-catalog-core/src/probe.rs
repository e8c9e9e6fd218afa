//! Video probing.
//!
//! [`Probe`] wraps a [`Decoder`] backend and turns raw stream statistics into
//! the derived feature set of one video ([`VideoFeatures`]). Every decoder
//! failure, a zero frame rate, a zero width, and an exceeded timeout become a
//! [`ProbeResult::Failure`] value; nothing here is fatal to a run.

pub mod ffprobe;

use std::{path::Path, sync::Arc, time::Duration};

use snafu::prelude::*;

pub use ffprobe::{DecoderConfig, FfprobeDecoder};

/// Errors a [`Decoder`] may report for a single video.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    /// The video file does not exist or could not be opened.
    #[snafu(display("Cannot open video {path}: {source}"))]
    Open {
        /// Path of the video.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The container or stream could not be decoded.
    #[snafu(display("Cannot decode video {path}: {message}"))]
    Corrupt {
        /// Path of the video.
        path: String,
        /// Backend-provided description.
        message: String,
    },

    /// The decoder output lacked a statistic or could not be parsed.
    #[snafu(display("Video {path} has no usable {what}"))]
    MissingStat {
        /// Path of the video.
        path: String,
        /// The statistic that was missing (for example `frame count`).
        what: &'static str,
    },

    /// The decoder did not finish within the per-item limit.
    #[snafu(display("Probe of {path} timed out after {}ms", limit.as_millis()))]
    TimedOut {
        /// Path of the video.
        path: String,
        /// The limit that was exceeded.
        limit: Duration,
    },
}

/// Raw statistics reported by a decoder for one video.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoStats {
    /// Number of frames in the video stream.
    pub frame_count: i64,
    /// Average frame rate.
    pub avg_fps: f64,
    /// Width of the first frame, in pixels.
    pub width: i64,
    /// Height of the first frame, in pixels.
    pub height: i64,
}

/// Capability that opens a video and reports its stream statistics.
///
/// Implementations must be deterministic per file: the same file always
/// yields the same statistics.
pub trait Decoder: Send + Sync {
    /// Open the video at `path` and read its statistics.
    ///
    /// With a `timeout`, the implementation stops its own work (and any
    /// process it started) once the limit passes and reports
    /// [`DecodeError::TimedOut`].
    fn open(&self, path: &Path, timeout: Option<Duration>) -> Result<VideoStats, DecodeError>;
}

/// Features derived from a successful probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoFeatures {
    /// Frame count.
    pub nframes: i64,
    /// Average frame rate.
    pub fps: f64,
    /// `nframes / fps`, in seconds.
    pub duration: f64,
    /// Width in pixels.
    pub width: i64,
    /// Height in pixels.
    pub height: i64,
    /// `height / width`.
    pub aspect_ratio: f64,
}

/// Outcome of probing a single video.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    /// The video was decoded and its features derived.
    Success(VideoFeatures),
    /// The video could not be probed.
    Failure {
        /// Path of the video.
        path: String,
        /// Human-readable reason.
        reason: String,
    },
}

impl ProbeResult {
    fn failure(path: &str, reason: impl Into<String>) -> Self {
        ProbeResult::Failure {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Derive features from raw statistics, or explain why that is impossible.
pub fn derive_features(stats: VideoStats) -> Result<VideoFeatures, String> {
    if !(stats.avg_fps.is_finite() && stats.avg_fps > 0.0) {
        return Err(format!("invalid frame rate {}", stats.avg_fps));
    }
    if stats.width <= 0 || stats.height <= 0 {
        return Err(format!(
            "invalid frame dimensions {}x{}",
            stats.width, stats.height
        ));
    }
    if stats.frame_count < 0 {
        return Err(format!("invalid frame count {}", stats.frame_count));
    }

    Ok(VideoFeatures {
        nframes: stats.frame_count,
        fps: stats.avg_fps,
        duration: stats.frame_count as f64 / stats.avg_fps,
        width: stats.width,
        height: stats.height,
        aspect_ratio: stats.height as f64 / stats.width as f64,
    })
}

/// Probes videos through a decoder backend chosen at construction.
pub struct Probe<D> {
    decoder: Arc<D>,
    timeout: Option<Duration>,
}

impl<D> Clone for Probe<D> {
    fn clone(&self) -> Self {
        Self {
            decoder: Arc::clone(&self.decoder),
            timeout: self.timeout,
        }
    }
}

impl<D: Decoder + 'static> Probe<D> {
    /// Create a probe that blocks on the decoder with no time limit.
    pub fn new(decoder: Arc<D>) -> Self {
        Self {
            decoder,
            timeout: None,
        }
    }

    /// Treat any probe taking longer than `timeout` as a failure.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe the video at `path`.
    pub fn probe(&self, path: &str) -> ProbeResult {
        match self.decoder.open(Path::new(path), self.timeout) {
            Ok(stats) => match derive_features(stats) {
                Ok(features) => ProbeResult::Success(features),
                Err(reason) => ProbeResult::failure(path, reason),
            },
            Err(e) => ProbeResult::failure(path, e.to_string()),
        }
    }
}
