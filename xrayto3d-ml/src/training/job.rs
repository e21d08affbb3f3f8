//! Job documents handed to the external trainer and the results it reports back.

use crate::checkpoint::manager::FILENAME_TEMPLATE;
use crate::data::{LoaderSpec, TransformSpec};
use crate::error::MlError;
use crate::experiments::ExperimentSpec;
use crate::persistence::atomic_write_json;
use crate::training::plan::{Accelerator, Devices};
use crate::zoo::Architecture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const JOB_FILE: &str = "job.json";
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Trainer loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerSettings {
    pub accelerator: Accelerator,
    pub devices: Devices,
    pub precision: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    pub deterministic: bool,
    pub log_every_n_steps: usize,
}

/// Optimization direction of the monitored metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    Min,
    Max,
}

/// Which checkpoints the trainer writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    pub dir: PathBuf,
    pub monitor: String,
    pub mode: MonitorMode,
    pub save_last: bool,
    /// `None` keeps every checkpoint.
    pub top_k: Option<usize>,
    pub filename: String,
}

impl CheckpointPolicy {
    /// Lowest validation loss wins; the last epoch is always kept.
    pub fn validation_loss(dir: PathBuf, top_k: Option<usize>) -> Self {
        Self {
            dir,
            monitor: "val/loss".to_string(),
            mode: MonitorMode::Min,
            save_last: true,
            top_k,
            filename: FILENAME_TEMPLATE.to_string(),
        }
    }
}

/// Where the trainer logs metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSpec {
    pub run_id: String,
    pub project: String,
    pub group: String,
    pub tags: Vec<String>,
    pub hyperparams: Map<String, Value>,
}

/// A `fit` or `smoke` job.
#[derive(Debug, Clone, Serialize)]
pub struct TrainJob {
    pub seed: u64,
    pub run_dir: PathBuf,
    pub experiment: ExperimentSpec,
    pub transforms: TransformSpec,
    pub train_loader: LoaderSpec,
    pub val_loader: LoaderSpec,
    pub trainer: TrainerSettings,
    pub checkpoint: CheckpointPolicy,
    pub tracking: TrackingSpec,
}

impl TrainJob {
    pub fn write(&self, path: &Path) -> Result<(), MlError> {
        atomic_write_json(path, self)?;
        Ok(())
    }
}

/// A `predict` job.
#[derive(Debug, Clone, Serialize)]
pub struct EvalJob {
    pub experiment: ExperimentSpec,
    pub transforms: TransformSpec,
    pub test_loader: LoaderSpec,
    pub trainer: TrainerSettings,
    /// Trainer checkpoint to restore; `None` when the weights were prepared up front.
    pub ckpt_path: Option<PathBuf>,
    /// Bare model weights already transplanted for the network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_weights: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub metric_log: PathBuf,
    pub voxel_spacing: f64,
    pub nsd_tolerance: f64,
}

impl EvalJob {
    pub fn write(&self, path: &Path) -> Result<(), MlError> {
        atomic_write_json(path, self)?;
        Ok(())
    }
}

/// A `describe` job: report the parameter names and shapes of the network the
/// trainer builds for this experiment.
#[derive(Debug, Clone, Serialize)]
pub struct DescribeJob {
    pub experiment: ExperimentSpec,
}

impl DescribeJob {
    /// File name for the job describing `architecture`.
    pub fn file_name(architecture: Architecture) -> String {
        format!("describe-{architecture}.json")
    }

    pub fn write(&self, path: &Path) -> Result<(), MlError> {
        atomic_write_json(path, self)?;
        Ok(())
    }
}

/// Observed (min, max) of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

/// Single-batch sanity check reported by `smoke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmokeReport {
    pub prediction_shape: Vec<usize>,
    pub ground_truth_shape: Vec<usize>,
    pub input: ValueRange,
    pub ground_truth: ValueRange,
    pub logits: ValueRange,
    pub loss: f64,
}

impl SmokeReport {
    pub fn shapes_match(&self) -> bool {
        self.prediction_shape == self.ground_truth_shape
    }
}

/// Result of a `predict` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub cases: usize,
    pub metric_log: PathBuf,
    #[serde(default)]
    pub predictions_dir: Option<PathBuf>,
}
