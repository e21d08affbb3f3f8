//! Subcommand handlers.

use crate::{BenchmarkCli, Commands, ConfigAction, EvaluateCli, TrainCli};
use std::path::Path;
use xrayto3d_ml::benchmark::{BenchmarkReporter, BenchmarkRequest, EvaluationScope};
use xrayto3d_ml::config::{XrayConfig, load_config, workspace_config_path};
use xrayto3d_ml::tracking::{LocalRunStore, open_store};
use xrayto3d_ml::training::{
    EvaluateArgs, EvaluationPlan, PythonTrainer, TrainArgs, TrainingOutcome, TrainingPlan,
    run_evaluation, run_training,
};
use xrayto3d_ml::{Anatomy, PythonRuntime};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, workspace).await,
        Commands::Train(args) => handle_train(args, workspace).await,
        Commands::Evaluate(args) => handle_evaluate(args, workspace).await,
        Commands::Benchmark(args) => handle_benchmark(args, workspace).await,
    }
}

fn load(workspace: &Path) -> anyhow::Result<XrayConfig> {
    load_config(Some(workspace), None).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
}

fn trainer(config: &XrayConfig, workspace: &Path) -> PythonTrainer {
    let runtime = PythonRuntime::from_config(&config.trainer, workspace.to_path_buf());
    PythonTrainer::new(runtime, config.trainer.entrypoint.clone())
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_path = workspace_config_path(workspace);
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }
            if let Some(dir) = config_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let toml_str = toml::to_string_pretty(&XrayConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn train_args(cli: TrainCli) -> anyhow::Result<TrainArgs> {
    Ok(TrainArgs {
        trainpaths: cli.trainpaths,
        valpaths: cli.valpaths,
        model_name: cli.model_name,
        loss: cli.loss,
        lr: cli.lr,
        epochs: cli.epochs,
        steps: cli.steps,
        size: cli.size,
        res: cli.res,
        batch_size: cli.batch_size,
        num_workers: cli.num_workers,
        accelerator: cli.accelerator.parse()?,
        precision: cli.precision,
        gpu: cli.gpu,
        project: cli.project,
        tags: cli.tags,
        debug: cli.debug,
        top_k_checkpoints: cli.top_k_checkpoints,
        lambda_bce: cli.lambda_bce,
        lambda_dice: cli.lambda_dice,
        dropout: cli.dropout,
        make_sparse: cli.make_sparse,
        load_autoencoder_from: cli.load_autoencoder_from,
    })
}

async fn handle_train(cli: TrainCli, workspace: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let plan = TrainingPlan::resolve(train_args(cli)?, &config)?;
    tracing::debug!(?plan, "Resolved training plan");

    let backend = trainer(&config, workspace);
    let store = LocalRunStore::new(workspace.join(&config.paths.runs_dir));
    let python = backend.runtime().info().await;

    match run_training(&plan, &backend, &store, python).await? {
        TrainingOutcome::Smoke { report, .. } => {
            println!("pred shape {:?} gt shape {:?}", report.prediction_shape, report.ground_truth_shape);
            println!("Groundtruth {} {}", report.ground_truth.min, report.ground_truth.max);
            println!("Input {} {}", report.input.min, report.input.max);
            println!("logits {} {}", report.logits.min, report.logits.max);
            println!("Loss {}", report.loss);
        }
        TrainingOutcome::Fit { run, metrics, .. } => {
            println!(
                "Run {} finished after {} epochs (best val/loss {})",
                run.id,
                metrics.epochs_completed,
                metrics
                    .best_loss
                    .map(|l| format!("{l:.4}"))
                    .unwrap_or_else(|| "n/a".to_string())
            );
        }
    }
    Ok(())
}

async fn handle_evaluate(cli: EvaluateCli, workspace: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let args = EvaluateArgs {
        testpaths: cli.testpaths,
        model_name: cli.model_name,
        ckpt_path: cli.ckpt_path,
        res: cli.res,
        load_autoencoder_from: cli.load_autoencoder_from,
        nsd_tolerance: cli.nsd_tolerance,
        image_size: cli.image_size,
        output_path: cli.output_path,
        batch_size: cli.batch_size,
        num_workers: cli.num_workers,
        accelerator: cli.accelerator.parse()?,
        precision: cli.precision,
        gpu: cli.gpu,
    };
    let plan = EvaluationPlan::resolve(args, &config)?;
    tracing::debug!(?plan, "Resolved evaluation plan");

    let backend = trainer(&config, workspace);
    let outcome = run_evaluation(&plan, &backend).await?;
    println!(
        "Evaluated {} cases; metrics written to {}",
        outcome.prediction.cases,
        outcome.prediction.metric_log.display()
    );
    Ok(())
}

async fn handle_benchmark(cli: BenchmarkCli, workspace: &Path) -> anyhow::Result<()> {
    let config = load(workspace)?;
    let anatomy: Anatomy = cli.anatomy.parse()?;
    let request = BenchmarkRequest {
        anatomy,
        tags: cli.tags,
        scope: EvaluationScope::from_flags(cli.domain_shift, cli.domain_shift_dataset.as_deref())?,
        save_json: cli.save_json,
    };

    let mut paths = config.paths.clone();
    paths.runs_dir = workspace.join(&paths.runs_dir);
    paths.metadata_dir = workspace.join(&paths.metadata_dir);
    let store = open_store(&config.tracking, &paths.runs_dir)?;
    let reporter = BenchmarkReporter::new(store.as_ref(), &paths, &config.tracking.project);

    let Some(report) = reporter.run(&request).await? else {
        println!("No runs found for {anatomy}");
        return Ok(());
    };
    println!("{}", report.table());
    if let Some(path) = &report.json_path {
        println!("Wrote {}", path.display());
    }
    Ok(())
}
