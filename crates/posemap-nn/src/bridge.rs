//! ndarray ⇄ candle tensor conversion for (N, C, H, W) batches.

use candle_core::{Device, Tensor};
use ndarray::{Array4, ArrayView4};

use crate::error::{Error, Result};

/// Copy a batch stack into a contiguous row-major tensor.
pub fn to_tensor(batch: ArrayView4<'_, f32>, device: &Device) -> Result<Tensor> {
    let dims = batch.dim();
    let data: Vec<f32> = batch.iter().copied().collect();
    Ok(Tensor::from_vec(data, dims, device)?)
}

/// Copy a rank-4 tensor back into an owned batch stack.
pub fn to_array(t: &Tensor) -> Result<Array4<f32>> {
    let dims = t.dims4()?;
    let data = t.flatten_all()?.to_vec1::<f32>()?;
    Array4::from_shape_vec(dims, data)
        .map_err(|e| Error::Config(format!("tensor does not fit its shape: {e}")))
}
