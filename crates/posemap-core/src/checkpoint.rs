//! Run-folder checkpoint convention and weight-file resolution.
//!
//! A training run writes `weights/weights.{epoch:03}-{val_loss:.9}` files
//! next to `initial_model`, `final_model` and (without per-epoch saving)
//! `best_model` snapshots. Prediction resolves one weight file out of a
//! run folder; a malformed name inside `weights/` is a hard error rather
//! than a silent skip.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// File extension of every weight snapshot.
pub const WEIGHTS_EXT: &str = "safetensors";

/// Name of the per-epoch weights subfolder inside a run folder.
pub const WEIGHTS_DIR: &str = "weights";

/// One parsed per-epoch checkpoint file.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightsEntry {
    pub path: PathBuf,
    pub epoch: usize,
    pub val_loss: f64,
}

/// Filename for the per-epoch checkpoint of (`epoch`, `val_loss`).
pub fn weights_file_name(epoch: usize, val_loss: f64) -> String {
    format!("weights.{epoch:03}-{val_loss:.9}.{WEIGHTS_EXT}")
}

/// Parse a `weights.{epoch}-{val_loss}` filename. Names not starting with
/// `weights.` belong to other files and return `None`; names that start
/// like a checkpoint but do not parse are an error.
pub fn parse_weights_name(name: &str) -> Result<Option<(usize, f64)>> {
    let Some(rest) = name.strip_prefix("weights.") else {
        return Ok(None);
    };
    let malformed = || Error::Checkpoint(format!("malformed weights filename '{name}'"));
    let rest = rest
        .strip_suffix(&format!(".{WEIGHTS_EXT}"))
        .ok_or_else(malformed)?;
    // The loss part may itself contain '-' (negative) so split once at the
    // separator after the epoch digits.
    let sep = rest.find('-').ok_or_else(malformed)?;
    let (epoch_str, loss_str) = rest.split_at(sep);
    let loss_str = &loss_str[1..];
    let epoch: usize = epoch_str.parse().map_err(|_| malformed())?;
    let val_loss: f64 = loss_str.parse().map_err(|_| malformed())?;
    if !val_loss.is_finite() {
        return Err(malformed());
    }
    Ok(Some((epoch, val_loss)))
}

/// List the per-epoch checkpoints of a run folder, name-sorted. Files in
/// `weights/` that do not carry the `weights.` prefix are ignored; a file
/// that carries it but fails to parse aborts the listing.
pub fn list_weights(run_path: &Path) -> Result<Vec<WeightsEntry>> {
    let dir = run_path.join(WEIGHTS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    let mut out = Vec::new();
    for name in names {
        if let Some((epoch, val_loss)) = parse_weights_name(&name)? {
            out.push(WeightsEntry {
                path: dir.join(&name),
                epoch,
                val_loss,
            });
        }
    }
    Ok(out)
}

/// Which snapshot of a run folder to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckpointChoice {
    /// Lowest validation loss among the per-epoch checkpoints, falling
    /// back to `best_model` and then `final_model` when none exist.
    #[default]
    Best,
    /// The `final_model` snapshot.
    Final,
    /// Position in the name-sorted `weights/` listing.
    Index(usize),
}

impl std::str::FromStr for CheckpointChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "best" => Ok(Self::Best),
            "final" => Ok(Self::Final),
            other => other.parse::<usize>().map(Self::Index).map_err(|_| {
                Error::Config(format!(
                    "invalid epoch choice '{other}' (expected best, final or an index)"
                ))
            }),
        }
    }
}

/// Resolve a model path to a weight file. A direct file path is used
/// as-is; a directory is treated as a run folder and resolved per
/// `choice`.
pub fn resolve_weights(model_path: &Path, choice: CheckpointChoice) -> Result<PathBuf> {
    if model_path.is_file() {
        return Ok(model_path.to_path_buf());
    }
    if !model_path.is_dir() {
        return Err(Error::Checkpoint(format!(
            "model path {} is neither a file nor a run folder",
            model_path.display()
        )));
    }
    let entries = list_weights(model_path)?;
    let found = match choice {
        CheckpointChoice::Best => {
            if let Some(best) = entries.iter().min_by(|a, b| {
                a.val_loss
                    .partial_cmp(&b.val_loss)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }) {
                best.path.clone()
            } else {
                let best_model = model_path.join(format!("best_model.{WEIGHTS_EXT}"));
                if best_model.is_file() {
                    best_model
                } else {
                    model_path.join(format!("final_model.{WEIGHTS_EXT}"))
                }
            }
        }
        CheckpointChoice::Final => model_path.join(format!("final_model.{WEIGHTS_EXT}")),
        CheckpointChoice::Index(k) => entries
            .get(k)
            .map(|e| e.path.clone())
            .ok_or_else(|| {
                Error::Checkpoint(format!(
                    "epoch index {k} out of range ({} checkpoints in {})",
                    entries.len(),
                    model_path.display()
                ))
            })?,
    };
    if !found.is_file() {
        return Err(Error::Checkpoint(format!(
            "weights file {} does not exist",
            found.display()
        )));
    }
    Ok(found)
}
