//! posemap-core — algorithms and I/O conventions for confidence-map pose
//! estimation.
//!
//! The training-side path is: dataset stacks → [`augment::PairedAugmenter`]
//! (per-sample rotation/scale warps from [`transform`]) → network batches.
//! The inference-side path is: network confidence maps →
//! [`peaks::find_peaks`] → integer keypoint positions, with optional u8
//! persistence via [`quantize`]. Containers ([`dataset`]), run-folder
//! weight selection ([`checkpoint`]) and the prediction output file
//! ([`artifact`]) round out the I/O contracts. No NN runtime lives here.

pub mod artifact;
pub mod augment;
pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod peaks;
pub mod quantize;
pub mod transform;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, Result};
pub use peaks::{find_peaks, MapLayout, Peak};
pub use transform::{Affine2x3, AffineJitter, CenterMode, Jitter};
