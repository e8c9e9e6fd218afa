//! Frame-count bucketing.
//!
//! Videos are grouped for batched model consumption by a frame-count class
//! that is aligned to two strides:
//!
//! - the VAE temporal stride: usable frame counts are `1 mod vae_stride`,
//! - the model's temporal downsampling factor: the number of VAE latents
//!   (`(frames - 1) / vae_stride + 1`) must itself be a multiple of it.
//!
//! The bucket is stored under a field whose name embeds both strides, so two
//! runs with different stride configurations never collide in one store.

use std::{fmt, num::NonZeroU32};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Frame counts below this value are too short to bucket.
pub const MIN_BUCKET_FRAMES: i64 = 29;

/// Bucket value assigned to videos shorter than [`MIN_BUCKET_FRAMES`].
pub const UNBUCKETED: i64 = -1;

/// Errors raised when constructing [`BucketStrides`].
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum BucketError {
    /// One of the strides was zero.
    #[snafu(display("{which} must be >= 1 (got 0)"))]
    ZeroStride {
        /// Which stride was zero (`vae_stride` or `model_stride`).
        which: &'static str,
    },
}

/// The two stride parameters that define a bucketing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketStrides {
    vae: NonZeroU32,
    model: NonZeroU32,
}

impl BucketStrides {
    /// Build a stride pair, rejecting zero values.
    pub fn new(vae_stride: u32, model_stride: u32) -> Result<Self, BucketError> {
        let vae = NonZeroU32::new(vae_stride).context(ZeroStrideSnafu {
            which: "vae_stride",
        })?;
        let model = NonZeroU32::new(model_stride).context(ZeroStrideSnafu {
            which: "model_stride",
        })?;
        Ok(Self { vae, model })
    }

    /// Temporal stride of the encoder.
    pub fn vae_stride(&self) -> u32 {
        self.vae.get()
    }

    /// Temporal downsampling factor of the model.
    pub fn model_stride(&self) -> u32 {
        self.model.get()
    }

    /// Bucket `nframes` under this configuration. See [`bucket`].
    pub fn bucket(&self, nframes: i64) -> i64 {
        bucket(nframes, *self)
    }

    /// Name of the field holding the bucket, e.g. `cut_frame_vst_4_mst_4`.
    ///
    /// Both the worker (when writing) and the indexer (when ordering) go
    /// through this function so the two names can never drift apart.
    pub fn field_name(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.suffix())
    }

    /// Stride suffix shared by bucket field names and table names.
    pub fn suffix(&self) -> String {
        format!("vst_{}_mst_{}", self.vae, self.model)
    }
}

impl fmt::Display for BucketStrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vae_stride={}, model_stride={}", self.vae, self.model)
    }
}

/// Compute the frame bucket for `nframes`.
///
/// Returns [`UNBUCKETED`] when `nframes < 29`. Otherwise rounds down to the
/// nearest count congruent to `1 mod vae_stride`, then, if the resulting
/// latent count is not a multiple of `model_stride`, drops the surplus
/// latents. Integer division is floor division throughout.
pub fn bucket(nframes: i64, strides: BucketStrides) -> i64 {
    if nframes < MIN_BUCKET_FRAMES {
        return UNBUCKETED;
    }

    let vae = i64::from(strides.vae_stride());
    let model = i64::from(strides.model_stride());

    let mut y = nframes - (nframes - 1).rem_euclid(vae);
    let remainder = ((y - 1).div_euclid(vae) + 1).rem_euclid(model);
    if remainder != 0 {
        y -= remainder * vae;
    }
    y
}
