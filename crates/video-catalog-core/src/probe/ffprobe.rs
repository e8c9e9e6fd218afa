//! `ffprobe`-backed [`Decoder`].
//!
//! Runs `ffprobe -of json` on the first video stream and reads the frame
//! count, average frame rate, and frame dimensions from its output. Under a
//! time limit the child is polled and killed once the limit passes.

use std::{
    io::{self, Read},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::Deserialize;
use snafu::prelude::*;

use super::{CorruptSnafu, DecodeError, Decoder, MissingStatSnafu, OpenSnafu, VideoStats};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Backend selection for [`FfprobeDecoder`], fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Binary to invoke. Defaults to `ffprobe` on `PATH`.
    pub ffprobe_bin: PathBuf,
    /// Decode the whole stream to count frames when the container does not
    /// record `nb_frames`. Slow but exact.
    pub count_frames: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            ffprobe_bin: PathBuf::from("ffprobe"),
            count_frames: false,
        }
    }
}

/// Decoder that shells out to `ffprobe`.
#[derive(Debug, Clone, Default)]
pub struct FfprobeDecoder {
    config: DecoderConfig,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<StreamInfo>,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
    width: Option<i64>,
    height: Option<i64>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    nb_read_frames: Option<String>,
}

impl FfprobeDecoder {
    /// Create a decoder using `config`.
    pub fn new(config: DecoderConfig) -> Self {
        Self { config }
    }

    fn command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.config.ffprobe_bin);
        cmd.args(["-v", "error", "-select_streams", "v:0"]);
        if self.config.count_frames {
            cmd.arg("-count_frames");
        }
        cmd.args([
            "-show_entries",
            "stream=width,height,avg_frame_rate,nb_frames,nb_read_frames",
            "-of",
            "json",
        ]);
        cmd.arg(path.as_os_str());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            // A read error only truncates diagnostics.
            let _ = stream.read_to_end(&mut buf);
        }
        buf
    })
}

/// Wait for `child`, killing and reaping it if `timeout` passes first.
/// Returns `None` on timeout.
fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
    let Some(limit) = timeout else {
        return child.wait().map(Some);
    };
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            // The child may exit between try_wait and kill.
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn parse_count(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
}

/// Parse an ffprobe rational such as `30000/1001` or a plain number.
pub(crate) fn parse_rate(raw: &str) -> Option<f64> {
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 { None } else { Some(num / den) }
        }
        None => raw.trim().parse().ok(),
    }
}

pub(crate) fn stats_from_json(path: &str, json: &[u8]) -> Result<VideoStats, DecodeError> {
    let output: ProbeOutput = serde_json::from_slice(json).map_err(|e| DecodeError::Corrupt {
        path: path.to_string(),
        message: format!("unreadable ffprobe output: {e}"),
    })?;

    let stream = output
        .streams
        .into_iter()
        .next()
        .context(MissingStatSnafu {
            path,
            what: "video stream",
        })?;

    let frame_count = parse_count(stream.nb_frames.as_deref())
        .or_else(|| parse_count(stream.nb_read_frames.as_deref()))
        .context(MissingStatSnafu {
            path,
            what: "frame count",
        })?;

    let avg_fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .context(MissingStatSnafu {
            path,
            what: "frame rate",
        })?;

    let width = stream.width.context(MissingStatSnafu {
        path,
        what: "frame width",
    })?;
    let height = stream.height.context(MissingStatSnafu {
        path,
        what: "frame height",
    })?;

    Ok(VideoStats {
        frame_count,
        avg_fps,
        width,
        height,
    })
}

impl Decoder for FfprobeDecoder {
    fn open(&self, path: &Path, timeout: Option<Duration>) -> Result<VideoStats, DecodeError> {
        let display = path.display().to_string();
        let mut child = self.command(path).spawn().context(OpenSnafu {
            path: display.clone(),
        })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_deadline(&mut child, timeout).context(OpenSnafu {
            path: display.clone(),
        })?;
        let Some(status) = status else {
            log::debug!("killed ffprobe for {display} after timeout");
            // Drain threads end once the pipes close; they are not joined.
            return Err(DecodeError::TimedOut {
                path: display,
                limit: timeout.unwrap_or_default(),
            });
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return CorruptSnafu {
                path: display,
                message: stderr.trim().to_string(),
            }
            .fail();
        }

        stats_from_json(&display, &stdout)
    }
}
