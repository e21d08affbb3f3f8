//! The seam to the process that actually runs the networks.

use crate::error::MlError;
use crate::runtime::PythonRuntime;
use crate::training::job::{DescribeJob, EvalJob, PredictionOutcome, SmokeReport, TrainJob};
use crate::training::metrics::TrainingMetrics;
use crate::zoo::ModelLayout;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::info;

/// Executes train/predict jobs.
#[async_trait]
pub trait TrainerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Fit the experiment; checkpoints go to `job.checkpoint.dir`.
    async fn fit(&self, job_path: &Path, job: &TrainJob) -> Result<TrainingMetrics, MlError>;

    /// Run inference and write the metric log.
    async fn predict(&self, job_path: &Path, job: &EvalJob) -> Result<PredictionOutcome, MlError>;

    /// Forward one training batch and report shapes, ranges and loss.
    async fn smoke_test(&self, job_path: &Path, job: &TrainJob) -> Result<SmokeReport, MlError>;

    /// Build the experiment's network and report its parameter names and shapes.
    async fn describe(&self, job_path: &Path, job: &DescribeJob) -> Result<ModelLayout, MlError>;
}

/// Runs jobs through a Python entrypoint:
/// `<entrypoint> <fit|predict|smoke|describe> --job <path>`.
///
/// The entrypoint prints its result as a single JSON object on the last line of stdout.
///
/// Checkpoints it writes hold the network's state dict under `model.` and loss
/// buffers under `loss_function.`. `describe` answers with
/// `{"architecture": ..., "parameters": {name: shape}}`, names given without the
/// `model.` prefix. Those names are the contract: strict loads of trainer
/// checkpoints are checked against them, not against names derived locally.
pub struct PythonTrainer {
    runtime: PythonRuntime,
    entrypoint: PathBuf,
}

impl PythonTrainer {
    pub fn new(runtime: PythonRuntime, entrypoint: PathBuf) -> Self {
        Self {
            runtime,
            entrypoint,
        }
    }

    pub fn runtime(&self) -> &PythonRuntime {
        &self.runtime
    }

    async fn invoke<T: DeserializeOwned>(&self, command: &str, job_path: &Path) -> Result<T, MlError> {
        let job = job_path.to_string_lossy();
        info!(command, job = %job, entrypoint = %self.entrypoint.display(), "Starting trainer");
        let stdout = self
            .runtime
            .run_script_file(&self.entrypoint, &[command, "--job", &job], None)
            .await?;
        parse_result(&stdout)
    }
}

#[async_trait]
impl TrainerBackend for PythonTrainer {
    fn name(&self) -> &str {
        "python"
    }

    async fn fit(&self, job_path: &Path, _job: &TrainJob) -> Result<TrainingMetrics, MlError> {
        self.invoke("fit", job_path).await
    }

    async fn predict(&self, job_path: &Path, _job: &EvalJob) -> Result<PredictionOutcome, MlError> {
        self.invoke("predict", job_path).await
    }

    async fn smoke_test(&self, job_path: &Path, _job: &TrainJob) -> Result<SmokeReport, MlError> {
        self.invoke("smoke", job_path).await
    }

    async fn describe(&self, job_path: &Path, _job: &DescribeJob) -> Result<ModelLayout, MlError> {
        self.invoke("describe", job_path).await
    }
}

/// Parse the last non-empty stdout line as the result object.
pub(crate) fn parse_result<T: DeserializeOwned>(stdout: &str) -> Result<T, MlError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| MlError::training("trainer produced no result on stdout"))?;
    serde_json::from_str(line)
        .map_err(|e| MlError::training(format!("malformed trainer result: {e}: {line}")))
}
