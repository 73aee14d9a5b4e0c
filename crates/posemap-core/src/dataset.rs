//! Array container I/O and network-input preprocessing.
//!
//! Datasets are safetensors files holding named tensors. The stored
//! sample layout follows the exporter convention (N, C, W, H); loading
//! promotes a missing batch dim, permutes to the network layout and
//! scales u8 data into [0, 1].

use std::path::Path;

use ndarray::{Array4, ArrayD, ArrayViewD, Axis, Ix4};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::error::{Error, Result};

/// Permutation from the stored (N, C, W, H) layout to the network
/// (N, C, H, W) layout.
pub const STORED_TO_NET: [usize; 4] = [0, 1, 3, 2];

/// Identity permutation for containers already in network layout.
pub const NET_LAYOUT: [usize; 4] = [0, 1, 2, 3];

/// One tensor loaded from a container.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    F32(ArrayD<f32>),
    U8(ArrayD<u8>),
    I64(ArrayD<i64>),
}

impl ArrayData {
    pub fn shape(&self) -> &[usize] {
        match self {
            ArrayData::F32(a) => a.shape(),
            ArrayData::U8(a) => a.shape(),
            ArrayData::I64(a) => a.shape(),
        }
    }
}

/// Borrowed tensor payload for [`save_arrays`].
#[derive(Debug, Clone)]
pub enum TensorData<'a> {
    F32(ArrayViewD<'a, f32>),
    U8(ArrayViewD<'a, u8>),
    I64(ArrayViewD<'a, i64>),
}

/// Write named tensors into a safetensors file.
pub fn save_arrays(path: &Path, arrays: &[(&str, TensorData<'_>)]) -> Result<()> {
    let mut payloads: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = Vec::with_capacity(arrays.len());
    for (name, data) in arrays {
        let (dtype, shape, bytes) = match data {
            TensorData::F32(a) => (Dtype::F32, a.shape().to_vec(), f32_bytes(a)),
            TensorData::U8(a) => (Dtype::U8, a.shape().to_vec(), a.iter().copied().collect()),
            TensorData::I64(a) => (Dtype::I64, a.shape().to_vec(), i64_bytes(a)),
        };
        payloads.push(((*name).to_string(), dtype, shape, bytes));
    }
    let mut views = Vec::with_capacity(payloads.len());
    for (name, dtype, shape, bytes) in &payloads {
        views.push((name.clone(), TensorView::new(*dtype, shape.clone(), bytes)?));
    }
    safetensors::serialize_to_file(views, &None, path)?;
    Ok(())
}

/// Names of the tensors stored in a container.
pub fn tensor_names(path: &Path) -> Result<Vec<String>> {
    let bytes = std::fs::read(path)?;
    let st = SafeTensors::deserialize(&bytes)?;
    Ok(st.names().into_iter().map(String::from).collect())
}

/// Load one named tensor. A missing name is a dataset error.
pub fn load_array(path: &Path, name: &str) -> Result<ArrayData> {
    let bytes = std::fs::read(path)?;
    let st = SafeTensors::deserialize(&bytes)?;
    let view = st.tensor(name).map_err(|_| {
        Error::Dataset(format!(
            "tensor '{}' not found in {}",
            name,
            path.display()
        ))
    })?;
    decode_view(&view, name)
}

fn decode_view(view: &TensorView<'_>, name: &str) -> Result<ArrayData> {
    let shape = view.shape().to_vec();
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => {
            let vals: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Ok(ArrayData::F32(dyn_array(shape, vals, name)?))
        }
        Dtype::U8 => Ok(ArrayData::U8(dyn_array(shape, data.to_vec(), name)?)),
        Dtype::I64 => {
            let vals: Vec<i64> = data
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect();
            Ok(ArrayData::I64(dyn_array(shape, vals, name)?))
        }
        other => Err(Error::Dataset(format!(
            "tensor '{name}' has unsupported dtype {other:?}"
        ))),
    }
}

fn dyn_array<T>(shape: Vec<usize>, vals: Vec<T>, name: &str) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(shape, vals)
        .map_err(|e| Error::Dataset(format!("tensor '{name}' is inconsistent: {e}")))
}

fn f32_bytes(a: &ArrayViewD<'_, f32>) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() * 4);
    for v in a.iter() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn i64_bytes(a: &ArrayViewD<'_, i64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() * 8);
    for v in a.iter() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Load a sample stack and prepare it for the network.
pub fn load_stack(path: &Path, name: &str, permute: [usize; 4]) -> Result<Array4<f32>> {
    preprocess(load_array(path, name)?, permute)
}

/// Prepare a raw stack for the network: promote a missing batch dim
/// ((C, W, H) to (1, C, W, H)), permute axes, scale u8 data to [0, 1].
pub fn preprocess(raw: ArrayData, permute: [usize; 4]) -> Result<Array4<f32>> {
    let mut sorted = permute;
    sorted.sort_unstable();
    if sorted != [0, 1, 2, 3] {
        return Err(Error::Config(format!(
            "preprocess: {permute:?} is not a permutation of the four axes"
        )));
    }
    let arr: ArrayD<f32> = match raw {
        ArrayData::F32(a) => a,
        ArrayData::U8(a) => a.mapv(|v| v as f32 / 255.0),
        ArrayData::I64(_) => {
            return Err(Error::Dataset(
                "preprocess: integer stacks are not valid network input".into(),
            ))
        }
    };
    let arr = match arr.ndim() {
        3 => arr.insert_axis(Axis(0)),
        4 => arr,
        n => {
            return Err(Error::Shape(format!(
                "preprocess: expected a 3-d or 4-d stack, got {n} dims"
            )))
        }
    };
    let arr = arr
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::Shape(e.to_string()))?;
    Ok(arr.permuted_axes(permute).as_standard_layout().to_owned())
}
