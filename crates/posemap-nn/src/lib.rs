//! posemap-nn — confidence-map pose networks, training loop and
//! inference pipeline on the candle runtime.
//!
//! [`model`] holds the network zoo built from a serializable
//! [`model::ModelConfig`]; [`train`] drives augmented mini-batch
//! optimization with ordered lifecycle hooks; [`predict`] turns a box
//! dataset plus a trained run folder into a peak artifact. [`bridge`]
//! converts between the ndarray stacks of `posemap-core` and candle
//! tensors.

pub mod bridge;
pub mod error;
pub mod model;
pub mod predict;
pub mod train;

pub use error::{Error, Result};
pub use model::{ModelConfig, ModelOutput, NetKind, PoseNet};
