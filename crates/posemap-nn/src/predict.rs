//! Inference pipeline: box dataset in, peak artifact out.
//!
//! The pass is bounded-memory: frames stream through the network in
//! chunks and only peaks (plus, optionally, quantized u8 maps) are kept.
//! Full-map persistence needs the exact global value range, so it runs a
//! second chunked forward pass instead of materializing the f32 stack.

use std::path::Path;
use std::time::Instant;

use candle_core::Device;
use candle_nn::{VarBuilder, VarMap};
use ndarray::{s, Array4};

use posemap_core::artifact::{check_output_path, RunArtifact, RunMeta};
use posemap_core::checkpoint::{resolve_weights, CheckpointChoice};
use posemap_core::dataset::{load_stack, STORED_TO_NET};
use posemap_core::peaks::{find_peaks, peaks_to_arrays, MapLayout, Peak};
use posemap_core::quantize::{merge_range, quantize_into};

use crate::bridge::{to_array, to_tensor};
use crate::error::{Error, Result};
use crate::model::{ModelConfig, PoseNet};

/// Knobs of one prediction pass.
#[derive(Debug, Clone)]
pub struct PredictOptions {
    /// Name of the box tensor in the input container.
    pub box_dset: String,
    /// Which run-folder snapshot to load.
    pub choice: CheckpointChoice,
    /// Samples per forward chunk.
    pub batch_size: usize,
    pub overwrite: bool,
    /// Persist quantized confidence maps next to the peaks.
    pub save_confmaps: bool,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            box_dset: "box".into(),
            choice: CheckpointChoice::Best,
            batch_size: 32,
            overwrite: false,
            save_confmaps: false,
        }
    }
}

/// Run inference over a box dataset and write the artifact to `out_path`.
pub fn run(
    box_path: &Path,
    model_path: &Path,
    out_path: &Path,
    opts: &PredictOptions,
) -> Result<RunArtifact> {
    let t0_all = Instant::now();
    check_output_path(out_path, opts.overwrite)?;

    let weights_path = resolve_weights(model_path, opts.choice)?;
    let config_dir = if model_path.is_dir() {
        model_path
    } else {
        model_path.parent().ok_or_else(|| {
            Error::Config(format!(
                "weights file {} has no parent folder to read model.json from",
                model_path.display()
            ))
        })?
    };
    let model_cfg = ModelConfig::load(config_dir)?;
    tracing::info!(
        "Loading {} weights: {}",
        model_cfg.net,
        weights_path.display()
    );

    let device = Device::Cpu;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &device);
    let model = PoseNet::new(&model_cfg, vb)?;
    varmap.load(&weights_path)?;

    let x = load_stack(box_path, &opts.box_dset, STORED_TO_NET)?;
    let (n, in_channels, h, w) = x.dim();
    tracing::info!("Predicting {n} samples of {in_channels}x{h}x{w}");

    let t0_pred = Instant::now();
    let chunk_size = opts.batch_size.max(1);
    let mut all_peaks: Vec<Vec<Peak>> = Vec::with_capacity(n);
    let mut range = (f32::INFINITY, f32::NEG_INFINITY);
    for start in (0..n).step_by(chunk_size) {
        let end = (start + chunk_size).min(n);
        let t = to_tensor(x.slice(s![start..end, .., .., ..]), &device)?;
        let out = model.forward(&t)?;
        let maps = to_array(out.last())?;
        if opts.save_confmaps {
            range = merge_range(range, maps.view());
        }
        all_peaks.extend(find_peaks(maps.view(), MapLayout::ChannelsFirst)?);
    }
    let (positions, confidences) = peaks_to_arrays(&all_peaks)?;
    let out_channels = confidences.dim().1;

    // Second pass for maps: the exact global range is only known after
    // every chunk was seen, and the f32 stack never fits in the budget.
    let confmaps = if opts.save_confmaps {
        let mut buf = Array4::<u8>::zeros((n, out_channels, w, h));
        for start in (0..n).step_by(chunk_size) {
            let end = (start + chunk_size).min(n);
            let t = to_tensor(x.slice(s![start..end, .., .., ..]), &device)?;
            let out = model.forward(&t)?;
            let maps = to_array(out.last())?;
            // Artifact maps use the stored (sample, channel, width,
            // height) layout.
            quantize_into(
                maps.view().permuted_axes([0, 1, 3, 2]),
                range.0,
                range.1,
                buf.slice_mut(s![start..end, .., .., ..]),
            )?;
        }
        Some(buf)
    } else {
        None
    };
    let prediction_runtime_secs = t0_pred.elapsed().as_secs_f64();

    let model_name = model_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let artifact = RunArtifact {
        positions,
        confidences,
        confmaps,
        meta: RunMeta {
            num_samples: n,
            img_size: [in_channels, h, w],
            box_path: box_path.display().to_string(),
            box_dset: opts.box_dset.clone(),
            model_path: model_path.display().to_string(),
            weights_path: weights_path.display().to_string(),
            model_name,
            confmap_range: opts.save_confmaps.then_some(range),
            total_runtime_secs: t0_all.elapsed().as_secs_f64(),
            prediction_runtime_secs,
        },
    };
    artifact.save(out_path)?;
    tracing::info!(
        "Saved predictions to {} [{:.1}s]",
        out_path.display(),
        artifact.meta.total_runtime_secs
    );
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use ndarray::ArrayD;
    use posemap_core::dataset::{save_arrays, TensorData};
    use posemap_core::error::Error as CoreError;
    use std::path::PathBuf;

    fn tmp_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("posemap-predict-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn make_run_folder(base: &Path) -> PathBuf {
        let run = base.join("run");
        std::fs::create_dir_all(&run).unwrap();
        let cfg = ModelConfig {
            net: crate::model::NetKind::EncDec,
            in_channels: 1,
            out_channels: 2,
            filters: 2,
            upsampling_layers: false,
        };
        cfg.save(&run).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _ = PoseNet::new(&cfg, vb).unwrap();
        varmap
            .save(run.join("final_model.safetensors"))
            .unwrap();
        run
    }

    fn make_box_file(base: &Path, n: usize) -> PathBuf {
        let path = base.join("box.safetensors");
        // Stored layout (N, C, W, H).
        let boxes = ArrayD::from_shape_fn(ndarray::IxDyn(&[n, 1, 8, 8]), |ix| {
            ((ix[0] + ix[2] * 3 + ix[3]) % 7) as f32 * 0.1
        });
        save_arrays(&path, &[("box", TensorData::F32(boxes.view()))]).unwrap();
        path
    }

    #[test]
    fn test_end_to_end_prediction_with_confmaps() {
        let dir = tmp_dir("e2e");
        let run = make_run_folder(&dir);
        let box_path = make_box_file(&dir, 3);
        let out = dir.join("preds.safetensors");

        let opts = PredictOptions {
            batch_size: 2,
            save_confmaps: true,
            ..PredictOptions::default()
        };
        let art = run_pipeline(&box_path, &run, &out, &opts);

        assert_eq!(art.positions.dim(), (3, 2, 2), "(sample, [x, y], joint)");
        assert_eq!(art.confidences.dim(), (3, 2));
        let maps = art.confmaps.as_ref().expect("maps requested");
        assert_eq!(maps.dim(), (3, 2, 8, 8), "(sample, channel, width, height)");
        assert!(art.meta.confmap_range.is_some());
        assert_eq!(art.meta.num_samples, 3);
        assert_eq!(art.meta.img_size, [1, 8, 8]);
        assert_eq!(art.meta.model_name, "run");
        assert!(art.meta.weights_path.ends_with("final_model.safetensors"));

        let back = RunArtifact::load(&out).unwrap();
        assert_eq!(back, art, "artifact on disk matches the returned one");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    fn run_pipeline(
        box_path: &Path,
        model_path: &Path,
        out_path: &Path,
        opts: &PredictOptions,
    ) -> RunArtifact {
        run(box_path, model_path, out_path, opts).unwrap()
    }

    #[test]
    fn test_chunked_and_single_pass_agree() {
        let dir = tmp_dir("chunks");
        let run_path = make_run_folder(&dir);
        let box_path = make_box_file(&dir, 5);

        let chunked = run(
            &box_path,
            &run_path,
            &dir.join("a.safetensors"),
            &PredictOptions {
                batch_size: 2,
                save_confmaps: true,
                ..PredictOptions::default()
            },
        )
        .unwrap();
        let single = run(
            &box_path,
            &run_path,
            &dir.join("b.safetensors"),
            &PredictOptions {
                batch_size: 64,
                save_confmaps: true,
                ..PredictOptions::default()
            },
        )
        .unwrap();

        assert_eq!(chunked.positions, single.positions);
        assert_eq!(chunked.confidences, single.confidences);
        assert_eq!(chunked.confmaps, single.confmaps);
        assert_eq!(chunked.meta.confmap_range, single.meta.confmap_range);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_existing_output_fails_fast() {
        let dir = tmp_dir("collision");
        let run_path = make_run_folder(&dir);
        let box_path = make_box_file(&dir, 2);
        let out = dir.join("preds.safetensors");
        std::fs::write(&out, b"old").unwrap();

        let err = run(&box_path, &run_path, &out, &PredictOptions::default()).unwrap_err();
        assert!(
            matches!(err, Error::Core(CoreError::OutputExists(_))),
            "got {err:?}"
        );

        let opts = PredictOptions {
            overwrite: true,
            ..PredictOptions::default()
        };
        run(&box_path, &run_path, &out, &opts).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_box_dset_fails() {
        let dir = tmp_dir("missing-dset");
        let run_path = make_run_folder(&dir);
        let box_path = make_box_file(&dir, 2);
        let opts = PredictOptions {
            box_dset: "frames".into(),
            ..PredictOptions::default()
        };
        let err = run(&box_path, &run_path, &dir.join("o.safetensors"), &opts).unwrap_err();
        assert!(
            matches!(err, Error::Core(CoreError::Dataset(_))),
            "got {err:?}"
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
