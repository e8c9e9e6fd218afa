//! Per-chunk processing: probe, bucket, assemble.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    bucket::{BucketStrides, UNBUCKETED},
    catalog::CatalogEntry,
    config::ProbeFailurePolicy,
    failure_log::FailureSink,
    probe::{Decoder, Probe, ProbeResult, VideoFeatures},
    record::{FieldManifest, ProcessedRecord},
};

/// Turns catalog entries into records.
///
/// A worker holds no mutable state of its own; the failure sink is the only
/// thing shared with other workers.
pub struct Worker<D> {
    probe: Probe<D>,
    strides: BucketStrides,
    manifest: Arc<FieldManifest>,
    sink: Arc<dyn FailureSink>,
    policy: ProbeFailurePolicy,
}

impl<D> Clone for Worker<D> {
    fn clone(&self) -> Self {
        Self {
            probe: self.probe.clone(),
            strides: self.strides,
            manifest: Arc::clone(&self.manifest),
            sink: Arc::clone(&self.sink),
            policy: self.policy,
        }
    }
}

/// Features recorded for an entry whose probe failed, under
/// [`ProbeFailurePolicy::Fallback`].
pub fn fallback_features(entry: &CatalogEntry) -> VideoFeatures {
    let width = entry.declared_resolution.width;
    let height = entry.declared_resolution.height;
    VideoFeatures {
        nframes: 0,
        fps: entry.declared_fps.unwrap_or(0.0),
        duration: entry.declared_duration.unwrap_or(0.0),
        width,
        height,
        aspect_ratio: if width == 0 {
            0.0
        } else {
            height as f64 / width as f64
        },
    }
}

impl<D: Decoder + 'static> Worker<D> {
    /// Build a worker.
    pub fn new(
        probe: Probe<D>,
        strides: BucketStrides,
        manifest: Arc<FieldManifest>,
        sink: Arc<dyn FailureSink>,
        policy: ProbeFailurePolicy,
    ) -> Self {
        Self {
            probe,
            strides,
            manifest,
            sink,
            policy,
        }
    }

    /// Process one entry. Failures go to the sink and, under the skip
    /// policy, produce nothing.
    pub fn process(&self, entry: &CatalogEntry) -> Option<ProcessedRecord> {
        match self.probe.probe(&entry.path) {
            ProbeResult::Success(features) => {
                let bucket = self.strides.bucket(features.nframes);
                Some(self.manifest.build(entry, &features, bucket))
            }
            ProbeResult::Failure { path, reason } => {
                self.sink.record(&path, &reason);
                match self.policy {
                    ProbeFailurePolicy::Skip => None,
                    ProbeFailurePolicy::Fallback => Some(self.manifest.build(
                        entry,
                        &fallback_features(entry),
                        UNBUCKETED,
                    )),
                }
            }
        }
    }

    /// Process a chunk, keeping catalog order among the surviving entries.
    pub fn run(&self, chunk: &[CatalogEntry]) -> Vec<ProcessedRecord> {
        self.run_until(chunk, &AtomicBool::new(false))
    }

    /// Like [`Worker::run`], but stops before the next entry once `stop` is
    /// set. Entries not yet started are neither probed nor reported.
    pub fn run_until(&self, chunk: &[CatalogEntry], stop: &AtomicBool) -> Vec<ProcessedRecord> {
        chunk
            .iter()
            .take_while(|_| !stop.load(Ordering::SeqCst))
            .filter_map(|entry| self.process(entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::{DEFAULT_BUCKET_PREFIX, FieldValue, NFRAMES, PATH},
        test_util::{RecordingSink, ScriptedDecoder},
    };

    fn worker(policy: ProbeFailurePolicy) -> (Worker<ScriptedDecoder>, Arc<RecordingSink>) {
        let decoder = ScriptedDecoder::new()
            .with_video("/v/a.mp4", 40, 30.0, 640, 360)
            .with_video("/v/b.mp4", 10, 30.0, 640, 360);
        let strides = BucketStrides::new(4, 4).expect("strides");
        let manifest = FieldManifest::new(strides, DEFAULT_BUCKET_PREFIX, Vec::new())
            .expect("manifest");
        let sink = Arc::new(RecordingSink::default());
        let worker = Worker::new(
            Probe::new(Arc::new(decoder)),
            strides,
            Arc::new(manifest),
            sink.clone(),
            policy,
        );
        (worker, sink)
    }

    fn entries() -> Vec<CatalogEntry> {
        ["/v/a.mp4", "/v/missing.mp4", "/v/b.mp4"]
            .into_iter()
            .map(|p| CatalogEntry::new(p, vec!["caption".into()], 640, 360))
            .collect()
    }

    #[test]
    fn skip_policy_drops_failures_and_reports_them() {
        let (worker, sink) = worker(ProbeFailurePolicy::Skip);
        let out = worker.run(&entries());

        let paths: Vec<_> = out.iter().filter_map(|r| r.get(PATH)).collect();
        assert_eq!(paths, vec![&FieldValue::from("/v/a.mp4"), &FieldValue::from("/v/b.mp4")]);
        assert_eq!(out[0].get("cut_frame_vst_4_mst_4"), Some(&FieldValue::Integer(29)));
        assert_eq!(out[1].get("cut_frame_vst_4_mst_4"), Some(&FieldValue::Integer(-1)));
        assert_eq!(sink.paths(), vec!["/v/missing.mp4".to_string()]);
    }

    #[test]
    fn fallback_policy_keeps_failures_unbucketed() {
        let (worker, sink) = worker(ProbeFailurePolicy::Fallback);
        let mut entries = entries();
        entries[1].declared_fps = Some(24.0);

        let out = worker.run(&entries);
        assert_eq!(out.len(), 3);
        let kept = &out[1];
        assert_eq!(kept.get(NFRAMES), Some(&FieldValue::Integer(0)));
        assert_eq!(kept.get("fps"), Some(&FieldValue::Real(24.0)));
        assert_eq!(kept.get("duration"), Some(&FieldValue::Real(0.0)));
        assert_eq!(kept.get("aspect_ratio"), Some(&FieldValue::Real(360.0 / 640.0)));
        assert_eq!(kept.get("cut_frame_vst_4_mst_4"), Some(&FieldValue::Integer(-1)));
        assert_eq!(sink.paths().len(), 1);
    }

    #[test]
    fn stop_flag_skips_remaining_entries() {
        let (worker, sink) = worker(ProbeFailurePolicy::Skip);
        let stop = AtomicBool::new(true);
        assert!(worker.run_until(&entries(), &stop).is_empty());
        assert!(sink.paths().is_empty());
    }

    #[test]
    fn fallback_aspect_ratio_is_zero_without_width() {
        let entry = CatalogEntry::new("x.mp4", vec![], 0, 10);
        assert_eq!(fallback_features(&entry).aspect_ratio, 0.0);
    }
}
