//! Train and evaluate drivers: build the experiment, write the job, hand it to the
//! trainer backend and record the outcome.

use crate::benchmark::{MetricLog, MetricSummary};
use crate::checkpoint::{CheckpointManager, transplant_autoencoder, transplant_predictor};
use crate::data::{DatasetManifest, LoaderSpec};
use crate::error::MlError;
use crate::experiments::{Experiment, ExperimentKind, OptimizerSpec};
use crate::losses::build_loss;
use crate::runtime::PythonInfo;
use crate::tracking::{LocalRunStore, RunRecord, RunState};
use crate::training::backend::TrainerBackend;
use crate::training::job::{
    CHECKPOINT_DIR, CheckpointPolicy, DescribeJob, EvalJob, JOB_FILE, PredictionOutcome,
    SmokeReport, TrackingSpec, TrainJob, TrainerSettings,
};
use crate::training::metrics::TrainingMetrics;
use crate::training::plan::{EvaluationPlan, TrainingPlan};
use crate::training::reproducibility::EnvironmentSnapshot;
use crate::zoo::{Architecture, ModelLayout, Network, build_model};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const AUTOENCODER_WEIGHTS: &str = "autoencoder.safetensors";
pub const PREDICTOR_WEIGHTS: &str = "predictor.safetensors";
const PREPARED_DIR: &str = "prepared";

/// What a `train` invocation produced.
#[derive(Debug, Clone)]
pub enum TrainingOutcome {
    /// Debug mode: one batch was run, nothing was trained.
    Smoke { job_path: PathBuf, report: SmokeReport },
    Fit {
        run: RunRecord,
        job_path: PathBuf,
        metrics: TrainingMetrics,
        removed_checkpoints: Vec<PathBuf>,
    },
}

/// What an `evaluate` invocation produced.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub job_path: PathBuf,
    pub prediction: PredictionOutcome,
    /// Mean metrics over the written log, when it could be read.
    pub summary: Option<MetricSummary>,
}

pub async fn run_training(
    plan: &TrainingPlan,
    backend: &dyn TrainerBackend,
    store: &LocalRunStore,
    python: Option<PythonInfo>,
) -> Result<TrainingOutcome, MlError> {
    let train = DatasetManifest::load(&plan.trainpaths).await?;
    let val = DatasetManifest::load(&plan.valpaths).await?;
    info!(
        training = train.len(),
        validation = val.len(),
        anatomy = %plan.anatomy,
        "Loaded manifests"
    );

    let model = build_model(plan.architecture, plan.image_size, plan.dropout)?;
    let hyperparams = plan.hyperparams(model.config())?;
    let loss = build_loss(plan.loss.name(), &plan.loss_context())?;
    let mut experiment = Experiment::for_training(
        model,
        OptimizerSpec::Adam { lr: plan.lr },
        loss,
        plan.batch_size,
    );
    experiment.set_make_sparse(plan.make_sparse)?;

    let mut run = RunRecord::new(&plan.project, &plan.group, plan.tags.clone(), hyperparams);
    let run_dir = run.run_dir(store.runs_dir());

    let decoder_checkpoint = match (&plan.autoencoder_checkpoint, experiment.kind()) {
        (Some(source), ExperimentKind::TlPredictor) => {
            let reference = build_model(Architecture::CustomAutoEncoder, plan.image_size, false)?;
            let layout = describe_network(backend, &reference, &run_dir).await?;
            let autoencoder = transplant_autoencoder(source, plan.image_size, layout)?;
            let path = run_dir.join(AUTOENCODER_WEIGHTS);
            save_weights(&autoencoder, &path)?;
            experiment.set_decoder(autoencoder)?;
            Some(path)
        }
        _ => None,
    };

    let transforms = experiment
        .kind()
        .transforms(plan.image_size, plan.resolution);
    let job = TrainJob {
        seed: plan.seed,
        run_dir: run_dir.clone(),
        experiment: experiment.spec(decoder_checkpoint),
        transforms,
        train_loader: LoaderSpec::training(
            plan.trainpaths.clone(),
            plan.batch_size,
            plan.num_workers,
        ),
        val_loader: LoaderSpec::evaluation(
            plan.valpaths.clone(),
            plan.batch_size,
            plan.num_workers,
        ),
        trainer: TrainerSettings {
            accelerator: plan.accelerator,
            devices: plan.devices(),
            precision: plan.precision,
            max_epochs: Some(plan.epochs),
            max_steps: plan.max_steps,
            deterministic: false,
            log_every_n_steps: 1,
        },
        checkpoint: CheckpointPolicy::validation_loss(
            run_dir.join(CHECKPOINT_DIR),
            plan.top_k_checkpoints,
        ),
        tracking: TrackingSpec {
            run_id: run.id.clone(),
            project: plan.project.clone(),
            group: plan.group.clone(),
            tags: plan.tags.clone(),
            hyperparams: run.config.clone(),
        },
    };
    let job_path = run_dir.join(JOB_FILE);
    job.write(&job_path)?;

    if plan.debug {
        let report = backend.smoke_test(&job_path, &job).await?;
        info!(
            prediction = ?report.prediction_shape,
            ground_truth = ?report.ground_truth_shape,
            input = ?(report.input.min, report.input.max),
            labels = ?(report.ground_truth.min, report.ground_truth.max),
            logits = ?(report.logits.min, report.logits.max),
            loss = report.loss,
            "Smoke test"
        );
        if !report.shapes_match() {
            warn!("Prediction and ground-truth shapes differ");
        }
        return Ok(TrainingOutcome::Smoke { job_path, report });
    }

    run.environment = Some(EnvironmentSnapshot::capture(plan.seed).with_python(python));
    store.save(&run)?;
    info!(run = %run.id, backend = backend.name(), "Training started");

    let metrics = match backend.fit(&job_path, &job).await {
        Ok(metrics) => metrics,
        Err(e) => {
            run.set_state(RunState::Failed);
            store.save(&run)?;
            return Err(e);
        }
    };

    run.metrics = Some(metrics.clone());
    run.set_state(RunState::Finished);
    store.save(&run)?;

    let removed_checkpoints =
        CheckpointManager::new(&job.checkpoint.dir, plan.top_k_checkpoints).enforce_retention()?;
    info!(
        run = %run.id,
        epochs = metrics.epochs_completed,
        best_loss = ?metrics.best_loss,
        removed = removed_checkpoints.len(),
        "Training finished"
    );

    Ok(TrainingOutcome::Fit {
        run,
        job_path,
        metrics,
        removed_checkpoints,
    })
}

pub async fn run_evaluation(
    plan: &EvaluationPlan,
    backend: &dyn TrainerBackend,
) -> Result<EvaluationOutcome, MlError> {
    let test = DatasetManifest::load(&plan.testpaths).await?;
    info!(cases = test.len(), checkpoint = %plan.checkpoint.display(), "Loaded test manifest");

    let model = build_model(plan.architecture, plan.image_size, false)?;
    let mut experiment = Experiment::for_inference(model);

    let (ckpt_path, model_weights, decoder_checkpoint) =
        match (&plan.autoencoder_checkpoint, experiment.kind()) {
            (Some(source), ExperimentKind::TlPredictor) => {
                let prepared = plan.output_dir.join(PREPARED_DIR);
                let reference = build_model(Architecture::CustomAutoEncoder, plan.image_size, false)?;
                let layout = describe_network(backend, &reference, &prepared).await?;
                let autoencoder = transplant_autoencoder(source, plan.image_size, layout)?;
                let decoder_path = prepared.join(AUTOENCODER_WEIGHTS);
                save_weights(&autoencoder, &decoder_path)?;
                experiment.set_decoder(autoencoder)?;

                let layout = describe_network(backend, experiment.model(), &prepared).await?;
                experiment.model_mut().adopt_layout(layout)?;
                transplant_predictor(&plan.checkpoint, experiment.model_mut())?;
                let predictor_path = prepared.join(PREDICTOR_WEIGHTS);
                save_weights(experiment.model(), &predictor_path)?;
                (None, Some(predictor_path), Some(decoder_path))
            }
            _ => (Some(plan.checkpoint.clone()), None, None),
        };

    let job = EvalJob {
        experiment: experiment.spec(decoder_checkpoint),
        transforms: experiment
            .kind()
            .transforms(plan.image_size, plan.resolution),
        test_loader: LoaderSpec::evaluation(
            plan.testpaths.clone(),
            plan.batch_size,
            plan.num_workers,
        ),
        trainer: TrainerSettings {
            accelerator: plan.accelerator,
            devices: plan.devices.clone(),
            precision: plan.precision,
            max_epochs: None,
            max_steps: None,
            deterministic: false,
            log_every_n_steps: 1,
        },
        ckpt_path,
        model_weights,
        output_dir: plan.output_dir.clone(),
        metric_log: plan.metric_log_path(),
        voxel_spacing: plan.resolution,
        nsd_tolerance: plan.nsd_tolerance,
    };
    let job_path = plan.output_dir.join(JOB_FILE);
    job.write(&job_path)?;

    let prediction = backend.predict(&job_path, &job).await?;
    let summary = match MetricLog::load(&prediction.metric_log).await {
        Ok(log) => {
            let summary = log.summary();
            info!(
                cases = log.cases(),
                dsc = summary.dsc,
                hd95 = summary.hd95,
                asd = summary.asd,
                nsd = summary.nsd,
                "Evaluation summary"
            );
            Some(summary)
        }
        Err(e) => {
            warn!(path = %prediction.metric_log.display(), error = %e, "No metric summary");
            None
        }
    };

    Ok(EvaluationOutcome {
        job_path,
        prediction,
        summary,
    })
}

/// Ask the trainer how it names `network`'s parameters. The job is written to `dir`.
async fn describe_network(
    backend: &dyn TrainerBackend,
    network: &Network,
    dir: &Path,
) -> Result<ModelLayout, MlError> {
    let job = DescribeJob {
        experiment: Experiment::for_inference(network.clone()).spec(None),
    };
    let job_path = dir.join(DescribeJob::file_name(network.architecture()));
    job.write(&job_path)?;
    let layout = backend.describe(&job_path, &job).await?;
    info!(
        architecture = %layout.architecture,
        parameters = layout.parameters.len(),
        "Trainer described model"
    );
    Ok(layout)
}

fn save_weights(network: &Network, path: &Path) -> Result<(), MlError> {
    network.to_checkpoint().save(path)?;
    info!(architecture = %network.architecture(), path = %path.display(), "Wrote prepared weights");
    Ok(())
}
