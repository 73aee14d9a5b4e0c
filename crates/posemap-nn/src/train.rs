//! Training pipeline: run folders, augmented batches, MSE optimization
//! and ordered lifecycle hooks.
//!
//! One run owns a folder under the base output path with `model.json`,
//! `training_info.json`, weight snapshots and `history.json`. Side
//! effects during training (checkpoints, history files, progress logs)
//! are hooks invoked in registration order at batch end, epoch end and
//! train end; the driver itself only optimizes.

use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder};

pub use candle_nn::VarMap;
use ndarray::{Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use posemap_core::augment::{PairedAugmenter, SamplerConfig};
use posemap_core::checkpoint::{weights_file_name, WEIGHTS_DIR, WEIGHTS_EXT};
use posemap_core::dataset::{load_stack, STORED_TO_NET};
use posemap_core::transform::{AffineJitter, Jitter};

use crate::bridge::to_tensor;
use crate::error::{Error, Result};
use crate::model::{ModelConfig, NetKind, PoseNet};

/// Everything a training run needs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrainConfig {
    /// Dataset container with the box and confmap tensors.
    pub data_path: PathBuf,
    /// Folder the run folder is created under.
    pub base_output_path: PathBuf,
    /// Run folder name; derived from data and net names when absent.
    pub run_name: Option<String>,
    /// Dataset name used in the derived run name.
    pub data_name: Option<String>,
    pub net: NetKind,
    /// Reuse an existing run folder instead of suffixing a fresh one.
    pub clean: bool,
    pub box_dset: String,
    pub confmap_dset: String,
    /// Validation split: fraction when < 1.0, absolute count otherwise.
    pub val_size: f64,
    /// Shuffle before splitting; otherwise validation takes the first
    /// samples.
    pub preshuffle: bool,
    pub filters: usize,
    /// Per-sample rotation/scale augmentation.
    pub jitter: AffineJitter,
    pub epochs: usize,
    pub batch_size: usize,
    pub batches_per_epoch: usize,
    pub val_batches_per_epoch: usize,
    pub learning_rate: f64,
    /// Per-epoch checkpoint files instead of tracking the best model.
    pub save_every_epoch: bool,
    pub upsampling_layers: bool,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::new(),
            base_output_path: PathBuf::from("models"),
            run_name: None,
            data_name: None,
            net: NetKind::EncDec,
            clean: false,
            box_dset: "box".into(),
            confmap_dset: "confmaps".into(),
            val_size: 0.15,
            preshuffle: true,
            filters: 64,
            jitter: AffineJitter {
                angle_deg: Jitter::Uniform {
                    lo: -15.0,
                    hi: 15.0,
                },
                ..AffineJitter::default()
            },
            epochs: 50,
            batch_size: 32,
            batches_per_epoch: 50,
            val_batches_per_epoch: 10,
            learning_rate: 1e-3,
            save_every_epoch: false,
            upsampling_layers: false,
            seed: 0,
        }
    }
}

/// Mean losses of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub loss: f64,
    pub val_loss: f64,
}

/// Ordered lifecycle hook; the driver calls hooks strictly in
/// registration order at each lifecycle point.
pub trait TrainHook {
    fn on_batch_end(&mut self, _epoch: usize, _batch: usize, _loss: f32) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, _report: &EpochReport, _vars: &VarMap) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _history: &[EpochReport]) -> Result<()> {
        Ok(())
    }
}

/// Weight-snapshot hook. With `save_every_epoch` every epoch lands in
/// `weights/`; otherwise `best_model` is overwritten on improvement.
pub struct CheckpointHook {
    run_path: PathBuf,
    save_every_epoch: bool,
    best_val: Option<f64>,
}

impl CheckpointHook {
    pub fn new(run_path: &Path, save_every_epoch: bool) -> Self {
        Self {
            run_path: run_path.to_path_buf(),
            save_every_epoch,
            best_val: None,
        }
    }
}

impl TrainHook for CheckpointHook {
    fn on_epoch_end(&mut self, report: &EpochReport, vars: &VarMap) -> Result<()> {
        if self.save_every_epoch {
            let name = weights_file_name(report.epoch, report.val_loss);
            vars.save(self.run_path.join(WEIGHTS_DIR).join(name))?;
        } else if self.best_val.map_or(true, |best| report.val_loss < best) {
            self.best_val = Some(report.val_loss);
            vars.save(self.run_path.join(format!("best_model.{WEIGHTS_EXT}")))?;
        }
        Ok(())
    }
}

/// Rewrites `history.json` with every epoch row seen so far.
pub struct HistoryHook {
    path: PathBuf,
    rows: Vec<EpochReport>,
}

impl HistoryHook {
    pub fn new(run_path: &Path) -> Self {
        Self {
            path: run_path.join("history.json"),
            rows: Vec::new(),
        }
    }
}

impl TrainHook for HistoryHook {
    fn on_epoch_end(&mut self, report: &EpochReport, _vars: &VarMap) -> Result<()> {
        self.rows.push(*report);
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.rows)?)?;
        Ok(())
    }
}

/// Split `0..n` into (train, validation) index vectors. `val_size` below
/// 1.0 is a fraction of `n`, otherwise an absolute count; validation
/// indices come from the front of the (optionally shuffled) order.
pub fn train_val_split(
    n: usize,
    val_size: f64,
    shuffle: bool,
    rng: &mut StdRng,
) -> Result<(Vec<usize>, Vec<usize>)> {
    let val_count = if val_size < 1.0 {
        (n as f64 * val_size).round() as usize
    } else {
        val_size as usize
    };
    if val_count == 0 || val_count >= n {
        return Err(Error::Config(format!(
            "val_size {val_size} leaves no training or no validation samples out of {n}"
        )));
    }
    let mut idx: Vec<usize> = (0..n).collect();
    if shuffle {
        idx.shuffle(rng);
    }
    let val = idx[..val_count].to_vec();
    let train = idx[val_count..].to_vec();
    Ok((train, val))
}

/// Create `<base>/<run_name>/` with its `weights/` subfolder. Without
/// `clean` an existing folder gets a `_01`, `_02`, … suffix; with it the
/// old contents are removed.
pub fn create_run_folders(base: &Path, run_name: &str, clean: bool) -> Result<PathBuf> {
    let mut run_path = base.join(run_name);
    if !clean {
        let mut i = 1;
        while run_path.exists() {
            run_path = base.join(format!("{run_name}_{i:02}"));
            i += 1;
        }
    }
    if run_path.exists() {
        std::fs::remove_dir_all(&run_path)?;
    }
    std::fs::create_dir_all(run_path.join(WEIGHTS_DIR))?;
    Ok(run_path)
}

/// Everything recorded about a run at creation time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrainingInfo {
    pub config: TrainConfig,
    pub run_name: String,
    pub data_name: String,
    pub train_idx: Vec<usize>,
    pub val_idx: Vec<usize>,
}

fn derived_names(cfg: &TrainConfig) -> (String, String) {
    let data_name = cfg.data_name.clone().unwrap_or_else(|| {
        cfg.data_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".into())
    });
    let run_name = cfg
        .run_name
        .clone()
        .unwrap_or_else(|| format!("{data_name}-{}_epochs={}", cfg.net, cfg.epochs));
    (data_name, run_name)
}

fn select_samples(stack: &Array4<f32>, idx: &[usize]) -> Array4<f32> {
    stack.select(Axis(0), idx)
}

/// Train a network and return the per-epoch history. `extra_hooks` run
/// after the stock checkpoint and history hooks at each lifecycle point.
pub fn run(cfg: &TrainConfig, extra_hooks: Vec<Box<dyn TrainHook>>) -> Result<Vec<EpochReport>> {
    if cfg.batches_per_epoch == 0 || cfg.val_batches_per_epoch == 0 {
        return Err(Error::Config(
            "batches_per_epoch and val_batches_per_epoch must be at least 1".into(),
        ));
    }
    let device = Device::Cpu;

    tracing::info!("Loading dataset: {}", cfg.data_path.display());
    let x = load_stack(&cfg.data_path, &cfg.box_dset, STORED_TO_NET)?;
    let y = load_stack(&cfg.data_path, &cfg.confmap_dset, STORED_TO_NET)?;
    let (n, in_channels, h, w) = x.dim();
    let out_channels = y.dim().1;
    tracing::info!("Loaded {n} samples of {in_channels}x{h}x{w}, {out_channels} body parts");

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let (train_idx, val_idx) = train_val_split(n, cfg.val_size, cfg.preshuffle, &mut rng)?;

    let model_cfg = ModelConfig {
        net: cfg.net,
        in_channels,
        out_channels,
        filters: cfg.filters,
        upsampling_layers: cfg.upsampling_layers,
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &device);
    let model = PoseNet::new(&model_cfg, vb)?;

    let (data_name, run_name) = derived_names(cfg);
    let run_path = create_run_folders(&cfg.base_output_path, &run_name, cfg.clean)?;
    tracing::info!("Created run folder: {}", run_path.display());

    model_cfg.save(&run_path)?;
    let info = TrainingInfo {
        config: cfg.clone(),
        run_name,
        data_name,
        train_idx: train_idx.clone(),
        val_idx: val_idx.clone(),
    };
    std::fs::write(
        run_path.join("training_info.json"),
        serde_json::to_string_pretty(&info)?,
    )?;
    varmap.save(run_path.join(format!("initial_model.{WEIGHTS_EXT}")))?;

    let sampler_cfg = |seed: u64| SamplerConfig {
        batch_size: cfg.batch_size,
        shuffle: true,
        jitter: cfg.jitter,
        seed,
    };
    let mut train_sampler = PairedAugmenter::new(
        select_samples(&x, &train_idx),
        select_samples(&y, &train_idx),
        &sampler_cfg(cfg.seed),
    )?;
    let mut val_sampler = PairedAugmenter::new(
        select_samples(&x, &val_idx),
        select_samples(&y, &val_idx),
        &sampler_cfg(cfg.seed.wrapping_add(1)),
    )?;

    let mut opt = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: cfg.learning_rate,
            ..Default::default()
        },
    )?;

    let mut hooks: Vec<Box<dyn TrainHook>> = vec![
        Box::new(CheckpointHook::new(&run_path, cfg.save_every_epoch)),
        Box::new(HistoryHook::new(&run_path)),
    ];
    hooks.extend(extra_hooks);

    let mut history = Vec::with_capacity(cfg.epochs);
    let mut train_step = 0usize;
    let mut val_step = 0usize;
    for epoch in 0..cfg.epochs {
        let mut loss_sum = 0.0f64;
        for batch in 0..cfg.batches_per_epoch {
            let (bx, by) = train_sampler.get_batch(train_step % train_sampler.len())?;
            train_step += 1;
            let x_t = to_tensor(bx.view(), &device)?;
            let y_t = to_tensor(by.view(), &device)?;

            let out = model.forward(&x_t)?;
            let heads = out.all();
            let mut batch_loss = loss::mse(heads[0], &y_t)?;
            for head in &heads[1..] {
                batch_loss = (batch_loss + loss::mse(head, &y_t)?)?;
            }
            opt.backward_step(&batch_loss)?;

            let loss_val = batch_loss.to_scalar::<f32>()?;
            loss_sum += loss_val as f64;
            for hook in &mut hooks {
                hook.on_batch_end(epoch, batch, loss_val)?;
            }
        }

        let mut val_sum = 0.0f64;
        for _ in 0..cfg.val_batches_per_epoch {
            let (bx, by) = val_sampler.get_batch(val_step % val_sampler.len())?;
            val_step += 1;
            let x_t = to_tensor(bx.view(), &device)?;
            let y_t = to_tensor(by.view(), &device)?;
            let out = model.forward(&x_t)?;
            let heads = out.all();
            let mut batch_loss = loss::mse(heads[0], &y_t)?;
            for head in &heads[1..] {
                batch_loss = (batch_loss + loss::mse(head, &y_t)?)?;
            }
            val_sum += batch_loss.to_scalar::<f32>()? as f64;
        }

        let report = EpochReport {
            epoch,
            loss: loss_sum / cfg.batches_per_epoch as f64,
            val_loss: val_sum / cfg.val_batches_per_epoch as f64,
        };
        for hook in &mut hooks {
            hook.on_epoch_end(&report, &varmap)?;
        }
        history.push(report);
    }

    varmap.save(run_path.join(format!("final_model.{WEIGHTS_EXT}")))?;
    for hook in &mut hooks {
        hook.on_train_end(&history)?;
    }
    tracing::info!("Training finished after {} epochs", cfg.epochs);
    Ok(history)
}
