//! Prediction output container.
//!
//! One inference pass produces a safetensors file with the predicted
//! positions, peak confidences and (optionally) quantized confidence
//! maps, plus a JSON sidecar with provenance metadata. The artifact is
//! write-once: an existing output path aborts the run unless overwrite
//! was requested, and nothing is written before the data is complete.

use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Array4};

use crate::dataset::{load_array, save_arrays, ArrayData, TensorData};
use crate::error::{Error, Result};

/// Tensor names inside the artifact file.
pub const POSITIONS_DSET: &str = "positions_pred";
pub const CONF_DSET: &str = "conf_pred";
pub const CONFMAPS_DSET: &str = "confmaps";

/// Provenance metadata stored in the JSON sidecar.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunMeta {
    pub num_samples: usize,
    /// Network-layout image shape (channels, height, width).
    pub img_size: [usize; 3],
    pub box_path: String,
    pub box_dset: String,
    pub model_path: String,
    pub weights_path: String,
    pub model_name: String,
    /// Global (min, max) of the f32 maps behind the u8 `confmaps` tensor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confmap_range: Option<(f32, f32)>,
    pub total_runtime_secs: f64,
    pub prediction_runtime_secs: f64,
}

/// One inference pass' worth of results.
#[derive(Debug, Clone, PartialEq)]
pub struct RunArtifact {
    /// Integer peak coordinates, (sample, [x, y], joint).
    pub positions: Array3<i64>,
    /// Peak map values, (sample, joint).
    pub confidences: Array2<f32>,
    /// Quantized maps in the stored (sample, channel, width, height)
    /// layout, present only when map persistence was requested.
    pub confmaps: Option<Array4<u8>>,
    pub meta: RunMeta,
}

/// Sidecar path for an artifact file.
pub fn meta_path(out_path: &Path) -> PathBuf {
    out_path.with_extension("json")
}

/// Abort if `out_path` (or its sidecar) already exists; with `overwrite`
/// the old files are removed instead.
pub fn check_output_path(out_path: &Path, overwrite: bool) -> Result<()> {
    for path in [out_path.to_path_buf(), meta_path(out_path)] {
        if path.exists() {
            if !overwrite {
                return Err(Error::OutputExists(out_path.to_path_buf()));
            }
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

impl RunArtifact {
    /// Write the tensors and the sidecar. The output path must have been
    /// cleared with [`check_output_path`] before the prediction started.
    pub fn save(&self, out_path: &Path) -> Result<()> {
        let (n, two, c) = self.positions.dim();
        if two != 2 {
            return Err(Error::Shape(format!(
                "positions must be (samples, 2, joints), got middle dim {two}"
            )));
        }
        if self.confidences.dim() != (n, c) {
            return Err(Error::Shape(format!(
                "confidences {:?} do not match positions ({n}, 2, {c})",
                self.confidences.dim()
            )));
        }
        if self.confmaps.is_some() != self.meta.confmap_range.is_some() {
            return Err(Error::Config(
                "confmaps and confmap_range must be saved together".into(),
            ));
        }

        let pos = self.positions.view().into_dyn();
        let conf = self.confidences.view().into_dyn();
        let mut tensors = vec![
            (POSITIONS_DSET, TensorData::I64(pos)),
            (CONF_DSET, TensorData::F32(conf)),
        ];
        if let Some(maps) = &self.confmaps {
            tensors.push((CONFMAPS_DSET, TensorData::U8(maps.view().into_dyn())));
        }
        save_arrays(out_path, &tensors)?;

        let json = serde_json::to_string_pretty(&self.meta)?;
        std::fs::write(meta_path(out_path), json)?;
        Ok(())
    }

    /// Read an artifact back from disk.
    pub fn load(out_path: &Path) -> Result<Self> {
        let meta: RunMeta = serde_json::from_str(&std::fs::read_to_string(meta_path(out_path))?)?;

        let positions = match load_array(out_path, POSITIONS_DSET)? {
            ArrayData::I64(a) => a
                .into_dimensionality()
                .map_err(|e| Error::Shape(e.to_string()))?,
            other => {
                return Err(Error::Dataset(format!(
                    "{POSITIONS_DSET} has unexpected dtype (shape {:?})",
                    other.shape()
                )))
            }
        };
        let confidences = match load_array(out_path, CONF_DSET)? {
            ArrayData::F32(a) => a
                .into_dimensionality()
                .map_err(|e| Error::Shape(e.to_string()))?,
            other => {
                return Err(Error::Dataset(format!(
                    "{CONF_DSET} has unexpected dtype (shape {:?})",
                    other.shape()
                )))
            }
        };
        let confmaps = if meta.confmap_range.is_some() {
            match load_array(out_path, CONFMAPS_DSET)? {
                ArrayData::U8(a) => Some(
                    a.into_dimensionality()
                        .map_err(|e| Error::Shape(e.to_string()))?,
                ),
                other => {
                    return Err(Error::Dataset(format!(
                        "{CONFMAPS_DSET} has unexpected dtype (shape {:?})",
                        other.shape()
                    )))
                }
            }
        } else {
            None
        };

        Ok(Self {
            positions,
            confidences,
            confmaps,
            meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tmp_dir;
    use ndarray::{Array2, Array3, Array4};

    fn meta(n: usize, with_maps: bool) -> RunMeta {
        RunMeta {
            num_samples: n,
            img_size: [1, 64, 64],
            box_path: "data/box.safetensors".into(),
            box_dset: "box".into(),
            model_path: "models/run".into(),
            weights_path: "models/run/final_model.safetensors".into(),
            model_name: "run".into(),
            confmap_range: with_maps.then_some((0.0, 1.0)),
            total_runtime_secs: 1.25,
            prediction_runtime_secs: 0.75,
        }
    }

    fn artifact(n: usize, c: usize, with_maps: bool) -> RunArtifact {
        RunArtifact {
            positions: Array3::from_shape_fn((n, 2, c), |(s, d, j)| (s * 10 + d * 5 + j) as i64),
            confidences: Array2::from_shape_fn((n, c), |(s, j)| (s + j) as f32 * 0.1),
            confmaps: with_maps
                .then(|| Array4::from_shape_fn((n, c, 4, 4), |(s, ch, _, _)| (s + ch) as u8)),
            meta: meta(n, with_maps),
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tmp_dir("artifact-roundtrip");
        let out = dir.join("preds.safetensors");
        let art = artifact(3, 2, true);
        check_output_path(&out, false).unwrap();
        art.save(&out).unwrap();

        let back = RunArtifact::load(&out).unwrap();
        assert_eq!(back, art, "artifact must survive the disk round trip");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_round_trip_without_confmaps() {
        let dir = tmp_dir("artifact-nomap");
        let out = dir.join("preds.safetensors");
        let art = artifact(2, 3, false);
        art.save(&out).unwrap();
        let back = RunArtifact::load(&out).unwrap();
        assert_eq!(back.confmaps, None);
        assert_eq!(back.meta.confmap_range, None);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_existing_output_aborts_without_overwrite() {
        let dir = tmp_dir("artifact-exists");
        let out = dir.join("preds.safetensors");
        std::fs::write(&out, b"old").unwrap();

        let err = check_output_path(&out, false).unwrap_err();
        assert!(matches!(err, Error::OutputExists(_)), "got {err:?}");
        assert_eq!(std::fs::read(&out).unwrap(), b"old", "nothing was touched");

        check_output_path(&out, true).unwrap();
        assert!(!out.exists(), "overwrite removes the stale file up front");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_inconsistent_artifact_is_rejected() {
        let dir = tmp_dir("artifact-bad");
        let out = dir.join("preds.safetensors");

        let mut art = artifact(2, 2, true);
        art.meta.confmap_range = None;
        assert!(art.save(&out).is_err(), "maps without a range must fail");

        let mut art = artifact(2, 2, false);
        art.confidences = Array2::zeros((3, 2));
        assert!(art.save(&out).is_err(), "mismatched sample counts must fail");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_meta_path_swaps_extension() {
        assert_eq!(
            meta_path(Path::new("out/preds.safetensors")),
            Path::new("out/preds.json")
        );
    }
}
