//! posemap CLI — train confidence-map pose networks and predict keypoints.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use posemap_core::checkpoint::CheckpointChoice;
use posemap_core::transform::{AffineJitter, CenterMode, Jitter};
use posemap_nn::model::NetKind;
use posemap_nn::predict::PredictOptions;
use posemap_nn::train::{EpochReport, TrainConfig, TrainHook, VarMap};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "posemap")]
#[command(about = "Animal-pose estimation via convolutional confidence maps")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a network on a box/confmap dataset.
    Train(CliTrainArgs),

    /// Predict keypoint positions for a box dataset.
    Predict(CliPredictArgs),
}

#[derive(Debug, Clone, Args)]
struct CliTrainArgs {
    /// Dataset container with box and confmap tensors.
    #[arg(long)]
    data: PathBuf,

    /// Folder the run folder is created under.
    #[arg(long, default_value = "models")]
    base_output_path: PathBuf,

    /// Run folder name (derived from data and net names when omitted).
    #[arg(long)]
    run_name: Option<String>,

    /// Dataset name used in the derived run name.
    #[arg(long)]
    data_name: Option<String>,

    /// Network architecture: enc_dec, hourglass or stacked_hourglass.
    #[arg(long, default_value = "enc_dec")]
    net: NetKind,

    /// Reuse an existing run folder instead of suffixing a fresh one.
    #[arg(long)]
    clean: bool,

    /// Name of the box tensor in the dataset.
    #[arg(long, default_value = "box")]
    box_dset: String,

    /// Name of the confidence-map tensor in the dataset.
    #[arg(long, default_value = "confmaps")]
    confmap_dset: String,

    /// Validation split: fraction when < 1.0, absolute count otherwise.
    #[arg(long, default_value = "0.15")]
    val_size: f64,

    /// Keep sample order when splitting (validation takes the first
    /// samples).
    #[arg(long)]
    no_preshuffle: bool,

    /// Baseline filter count.
    #[arg(long, default_value = "64")]
    filters: usize,

    /// Augmentation rotation range: angles drawn uniformly from
    /// [-rotate_angle, rotate_angle] degrees.
    #[arg(long, default_value = "15.0")]
    rotate_angle: f32,

    /// Lower bound of the augmentation scale range.
    #[arg(long, default_value = "1.0")]
    scale_min: f32,

    /// Upper bound of the augmentation scale range.
    #[arg(long, default_value = "1.0")]
    scale_max: f32,

    /// Rotate about the geometric center (w/2, h/2) instead of the
    /// historical (h/2, h/2) convention.
    #[arg(long)]
    centered_rotation: bool,

    #[arg(long, default_value = "50")]
    epochs: usize,

    #[arg(long, default_value = "32")]
    batch_size: usize,

    #[arg(long, default_value = "50")]
    batches_per_epoch: usize,

    #[arg(long, default_value = "10")]
    val_batches_per_epoch: usize,

    #[arg(long, default_value = "0.001")]
    learning_rate: f64,

    /// Write a weights/ checkpoint every epoch instead of tracking the
    /// best model.
    #[arg(long)]
    save_every_epoch: bool,

    /// Nearest-neighbor upsampling instead of learned transposed convs.
    #[arg(long)]
    upsampling_layers: bool,

    /// Seed for splitting, shuffling and augmentation draws.
    #[arg(long, default_value = "0")]
    seed: u64,
}

impl CliTrainArgs {
    fn to_config(&self) -> TrainConfig {
        let angle = self.rotate_angle.abs();
        let jitter = AffineJitter {
            angle_deg: if angle == 0.0 {
                Jitter::Fixed(0.0)
            } else {
                Jitter::Uniform {
                    lo: -angle,
                    hi: angle,
                }
            },
            scale: if self.scale_min == self.scale_max {
                Jitter::Fixed(self.scale_min)
            } else {
                Jitter::Uniform {
                    lo: self.scale_min,
                    hi: self.scale_max,
                }
            },
            center: if self.centered_rotation {
                CenterMode::Centered
            } else {
                CenterMode::HalfHeight
            },
        };
        TrainConfig {
            data_path: self.data.clone(),
            base_output_path: self.base_output_path.clone(),
            run_name: self.run_name.clone(),
            data_name: self.data_name.clone(),
            net: self.net,
            clean: self.clean,
            box_dset: self.box_dset.clone(),
            confmap_dset: self.confmap_dset.clone(),
            val_size: self.val_size,
            preshuffle: !self.no_preshuffle,
            filters: self.filters,
            jitter,
            epochs: self.epochs,
            batch_size: self.batch_size,
            batches_per_epoch: self.batches_per_epoch,
            val_batches_per_epoch: self.val_batches_per_epoch,
            learning_rate: self.learning_rate,
            save_every_epoch: self.save_every_epoch,
            upsampling_layers: self.upsampling_layers,
            seed: self.seed,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct CliPredictArgs {
    /// Dataset container with the box tensor.
    #[arg(long = "box")]
    box_path: PathBuf,

    /// Weights file or run folder with a weights subfolder.
    #[arg(long)]
    model: PathBuf,

    /// Output artifact path.
    #[arg(long)]
    out: PathBuf,

    /// Name of the box tensor in the dataset.
    #[arg(long, default_value = "box")]
    box_dset: String,

    /// Run-folder snapshot: best, final or a checkpoint index.
    #[arg(long, default_value = "best")]
    epoch: CheckpointChoice,

    /// Samples per forward chunk.
    #[arg(long, default_value = "32")]
    batch_size: usize,

    /// Replace an existing output file.
    #[arg(long)]
    overwrite: bool,

    /// Persist quantized confidence maps next to the peaks (large).
    #[arg(long)]
    save_confmaps: bool,
}

impl CliPredictArgs {
    fn to_options(&self) -> PredictOptions {
        PredictOptions {
            box_dset: self.box_dset.clone(),
            choice: self.epoch,
            batch_size: self.batch_size,
            overwrite: self.overwrite,
            save_confmaps: self.save_confmaps,
        }
    }
}

/// Reports epoch progress through tracing.
struct ProgressHook {
    epochs: usize,
}

impl TrainHook for ProgressHook {
    fn on_epoch_end(&mut self, report: &EpochReport, _vars: &VarMap) -> posemap_nn::Result<()> {
        tracing::info!(
            "epoch {}/{}: loss {:.6}, val_loss {:.6}",
            report.epoch + 1,
            self.epochs,
            report.loss,
            report.val_loss
        );
        Ok(())
    }

    fn on_train_end(&mut self, history: &[EpochReport]) -> posemap_nn::Result<()> {
        if let Some(best) = history
            .iter()
            .min_by(|a, b| a.val_loss.total_cmp(&b.val_loss))
        {
            tracing::info!(
                "best val_loss {:.6} at epoch {}",
                best.val_loss,
                best.epoch + 1
            );
        }
        Ok(())
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => run_train(&args),
        Commands::Predict(args) => run_predict(&args),
    }
}

fn run_train(args: &CliTrainArgs) -> CliResult<()> {
    let cfg = args.to_config();
    let hooks: Vec<Box<dyn TrainHook>> = vec![Box::new(ProgressHook { epochs: cfg.epochs })];
    let history = posemap_nn::train::run(&cfg, hooks)?;
    tracing::info!("trained {} epochs", history.len());
    Ok(())
}

fn run_predict(args: &CliPredictArgs) -> CliResult<()> {
    let artifact = posemap_nn::predict::run(
        &args.box_path,
        &args.model,
        &args.out,
        &args.to_options(),
    )?;
    tracing::info!(
        "{} samples, {} joints in {:.1}s",
        artifact.meta.num_samples,
        artifact.confidences.dim().1,
        artifact.meta.total_runtime_secs
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_args_to_config() {
        let cli = Cli::parse_from([
            "posemap",
            "train",
            "--data",
            "data.safetensors",
            "--net",
            "stacked_hourglass",
            "--rotate-angle",
            "30",
            "--scale-min",
            "0.9",
            "--scale-max",
            "1.1",
            "--centered-rotation",
            "--no-preshuffle",
            "--epochs",
            "3",
        ]);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let cfg = args.to_config();
        assert_eq!(cfg.net, NetKind::StackedHourglass);
        assert_eq!(cfg.epochs, 3);
        assert!(!cfg.preshuffle);
        assert_eq!(
            cfg.jitter.angle_deg,
            Jitter::Uniform {
                lo: -30.0,
                hi: 30.0
            }
        );
        assert_eq!(cfg.jitter.scale, Jitter::Uniform { lo: 0.9, hi: 1.1 });
        assert_eq!(cfg.jitter.center, CenterMode::Centered);
    }

    #[test]
    fn test_predict_args_to_options() {
        let cli = Cli::parse_from([
            "posemap",
            "predict",
            "--box",
            "box.safetensors",
            "--model",
            "models/run",
            "--out",
            "preds.safetensors",
            "--epoch",
            "final",
            "--save-confmaps",
        ]);
        let Commands::Predict(args) = cli.command else {
            panic!("expected predict");
        };
        let opts = args.to_options();
        assert_eq!(opts.choice, CheckpointChoice::Final);
        assert!(opts.save_confmaps);
        assert!(!opts.overwrite);
        assert_eq!(opts.box_dset, "box");
    }

    #[test]
    fn test_default_rotation_is_legacy_center() {
        let cli = Cli::parse_from(["posemap", "train", "--data", "d.safetensors"]);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let cfg = args.to_config();
        assert_eq!(cfg.jitter.center, CenterMode::HalfHeight);
        assert_eq!(cfg.jitter.scale, Jitter::Fixed(1.0));
    }
}
