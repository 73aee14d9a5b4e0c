//! Min-max u8 quantization of confidence-map stacks.
//!
//! Quantization always uses one global range for the whole stack rather
//! than per-channel ranges, so relative peak heights across channels
//! survive the round trip. The range is kept next to the data; callers
//! can dequantize to within one step of the source values.

use ndarray::{Array4, ArrayView4, ArrayViewMut4};

use crate::error::{Error, Result};

/// Global (min, max) over a stack. An empty stack yields
/// (`f32::INFINITY`, `f32::NEG_INFINITY`).
pub fn value_range(maps: ArrayView4<'_, f32>) -> (f32, f32) {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in maps.iter() {
        if v < lo {
            lo = v;
        }
        if v > hi {
            hi = v;
        }
    }
    (lo, hi)
}

/// Widen `(lo, hi)` to cover another chunk's range.
pub fn merge_range(range: (f32, f32), chunk: ArrayView4<'_, f32>) -> (f32, f32) {
    let (lo, hi) = value_range(chunk);
    (range.0.min(lo), range.1.max(hi))
}

/// Quantize `maps` into `out` over a fixed `(min, max)` range: values map
/// through `(v - min) / (max - min) * 255` with a truncating cast. A flat
/// range (max <= min) quantizes to zeros.
pub fn quantize_into(
    maps: ArrayView4<'_, f32>,
    min: f32,
    max: f32,
    mut out: ArrayViewMut4<'_, u8>,
) -> Result<()> {
    if maps.dim() != out.dim() {
        return Err(Error::Shape(format!(
            "quantize_into: source {:?} vs destination {:?}",
            maps.dim(),
            out.dim()
        )));
    }
    let range = max - min;
    if range <= 0.0 {
        out.fill(0);
        return Ok(());
    }
    for (o, &v) in out.iter_mut().zip(maps.iter()) {
        *o = ((v - min) / range * 255.0) as u8;
    }
    Ok(())
}

/// Quantized stack with the range needed to undo it.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedMaps {
    /// u8 maps, same axis order as the source.
    pub data: Array4<u8>,
    pub min: f32,
    pub max: f32,
}

/// One-shot quantization over the stack's own global range.
pub fn quantize(maps: ArrayView4<'_, f32>) -> Result<QuantizedMaps> {
    let (min, max) = value_range(maps);
    if !min.is_finite() || !max.is_finite() {
        return Err(Error::Shape("quantize: empty or non-finite stack".into()));
    }
    let mut data = Array4::zeros(maps.raw_dim());
    quantize_into(maps, min, max, data.view_mut())?;
    Ok(QuantizedMaps { data, min, max })
}

impl QuantizedMaps {
    /// Undo the quantization. A flat-range stack dequantizes to `min`
    /// everywhere.
    pub fn dequantize(&self) -> Array4<f32> {
        let range = self.max - self.min;
        if range <= 0.0 {
            return self.data.mapv(|_| self.min);
        }
        self.data.mapv(|q| q as f32 / 255.0 * range + self.min)
    }
}
