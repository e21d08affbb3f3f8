//! Resolution of raw command-line arguments into immutable train/evaluate plans.

use crate::anatomy::Anatomy;
use crate::checkpoint::resolve_checkpoint;
use crate::config::XrayConfig;
use crate::error::MlError;
use crate::experiments::ExperimentKind;
use crate::losses::{LossContext, LossKind};
use crate::tracking::MODEL_NAME_KEY;
use crate::zoo::{Architecture, ModelConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// Hardware the trainer runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    #[default]
    Gpu,
    Cpu,
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accelerator::Gpu => write!(f, "gpu"),
            Accelerator::Cpu => write!(f, "cpu"),
        }
    }
}

impl FromStr for Accelerator {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gpu" | "cuda" => Ok(Accelerator::Gpu),
            "cpu" => Ok(Accelerator::Cpu),
            other => Err(MlError::invalid_input(format!(
                "unknown accelerator '{other}' (expected gpu or cpu)"
            ))),
        }
    }
}

/// Device selection handed to the trainer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Devices {
    /// Number of devices (CPU processes).
    Count(usize),
    /// Explicit GPU indices.
    Indices(Vec<usize>),
}

impl Devices {
    /// All cores on CPU, otherwise only the selected GPU.
    pub fn for_accelerator(accelerator: Accelerator, gpu: usize) -> Self {
        match accelerator {
            Accelerator::Cpu => Devices::Count(
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
            ),
            Accelerator::Gpu => Devices::Indices(vec![gpu]),
        }
    }
}

/// Half precision on the first GPU, full precision elsewhere, unless given.
pub fn default_precision(explicit: Option<u8>, gpu: usize) -> u8 {
    explicit.unwrap_or(if gpu == 0 { 16 } else { 32 })
}

/// Evaluation always runs half precision on the first GPU; elsewhere as for training.
pub fn evaluation_precision(explicit: Option<u8>, gpu: usize) -> u8 {
    if gpu != 0 {
        return default_precision(explicit, gpu);
    }
    if let Some(requested) = explicit.filter(|&p| p != 16) {
        warn!(requested, "Evaluation on GPU 0 runs at 16-bit precision");
    }
    16
}

/// Raw `train` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainArgs {
    pub trainpaths: PathBuf,
    pub valpaths: PathBuf,
    pub model_name: String,
    pub loss: String,
    pub lr: f64,
    pub epochs: usize,
    /// Negative means unbounded.
    pub steps: i64,
    pub size: usize,
    pub res: f64,
    pub batch_size: usize,
    pub num_workers: usize,
    pub accelerator: Accelerator,
    pub precision: Option<u8>,
    pub gpu: usize,
    /// Falls back to `tracking.project`.
    pub project: Option<String>,
    pub tags: Vec<String>,
    pub debug: bool,
    /// Negative keeps every checkpoint.
    pub top_k_checkpoints: i64,
    pub lambda_bce: f64,
    pub lambda_dice: f64,
    pub dropout: bool,
    pub make_sparse: bool,
    pub load_autoencoder_from: Option<PathBuf>,
}

impl Default for TrainArgs {
    fn default() -> Self {
        Self {
            trainpaths: PathBuf::new(),
            valpaths: PathBuf::new(),
            model_name: String::new(),
            loss: LossKind::Dice.name().to_string(),
            lr: 2e-4,
            epochs: 100,
            steps: -1,
            size: 64,
            res: 1.5,
            batch_size: 4,
            num_workers: 4,
            accelerator: Accelerator::Gpu,
            precision: None,
            gpu: 0,
            project: None,
            tags: Vec::new(),
            debug: false,
            top_k_checkpoints: 1,
            lambda_bce: 1.0,
            lambda_dice: 1.0,
            dropout: false,
            make_sparse: false,
            load_autoencoder_from: None,
        }
    }
}

/// Fully resolved training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingPlan {
    pub trainpaths: PathBuf,
    pub valpaths: PathBuf,
    pub anatomy: Anatomy,
    pub architecture: Architecture,
    pub experiment: ExperimentKind,
    pub loss: LossKind,
    pub lr: f64,
    pub epochs: usize,
    pub max_steps: Option<u64>,
    pub image_size: usize,
    pub resolution: f64,
    pub batch_size: usize,
    pub num_workers: usize,
    pub accelerator: Accelerator,
    pub precision: u8,
    pub gpu: usize,
    pub seed: u64,
    pub project: String,
    pub group: String,
    pub tags: Vec<String>,
    pub debug: bool,
    pub top_k_checkpoints: Option<usize>,
    pub lambda_bce: f64,
    pub lambda_dice: f64,
    pub dropout: bool,
    pub make_sparse: bool,
    pub autoencoder_checkpoint: Option<PathBuf>,
}

impl TrainingPlan {
    pub fn resolve(args: TrainArgs, config: &XrayConfig) -> Result<Self, MlError> {
        let anatomy = Anatomy::from_path(&args.trainpaths)?;
        anatomy.check_geometry(args.size, args.res)?;
        let architecture: Architecture = args.model_name.parse()?;
        let loss: LossKind = args.loss.parse()?;
        let experiment = ExperimentKind::for_architecture(architecture);

        if args.lr <= 0.0 || !args.lr.is_finite() {
            return Err(MlError::invalid_input(format!(
                "learning rate must be positive, got {}",
                args.lr
            )));
        }
        if args.epochs == 0 {
            return Err(MlError::invalid_input("epochs must be at least 1"));
        }
        if args.batch_size == 0 {
            return Err(MlError::invalid_input("batch size must be at least 1"));
        }
        if args.make_sparse && experiment != ExperimentKind::Autoencoder {
            return Err(MlError::invalid_input(format!(
                "--make-sparse only applies to {}, not {architecture}",
                Architecture::CustomAutoEncoder
            )));
        }
        let autoencoder_checkpoint = match (experiment, args.load_autoencoder_from) {
            (ExperimentKind::TlPredictor, None) => {
                return Err(MlError::invalid_input(format!(
                    "{architecture} requires --load-autoencoder-from"
                )));
            }
            (ExperimentKind::TlPredictor, Some(path)) => Some(path),
            (_, _) => None,
        };

        let group = architecture.name().to_string();
        let mut tags = vec![group.clone(), anatomy.to_string(), loss.name().to_string()];
        tags.extend(args.tags);

        Ok(Self {
            trainpaths: args.trainpaths,
            valpaths: args.valpaths,
            anatomy,
            architecture,
            experiment,
            loss,
            lr: args.lr,
            epochs: args.epochs,
            max_steps: u64::try_from(args.steps).ok(),
            image_size: args.size,
            resolution: args.res,
            batch_size: args.batch_size,
            num_workers: args.num_workers,
            accelerator: args.accelerator,
            precision: default_precision(args.precision, args.gpu),
            gpu: args.gpu,
            seed: config.training.seed,
            project: args
                .project
                .unwrap_or_else(|| config.tracking.project.clone()),
            group,
            tags,
            debug: args.debug,
            top_k_checkpoints: usize::try_from(args.top_k_checkpoints).ok(),
            lambda_bce: args.lambda_bce,
            lambda_dice: args.lambda_dice,
            dropout: args.dropout,
            make_sparse: args.make_sparse,
            autoencoder_checkpoint,
        })
    }

    pub fn loss_context(&self) -> LossContext {
        LossContext::new(self.anatomy, self.image_size)
            .with_lambdas(self.lambda_dice, self.lambda_bce)
    }

    pub fn devices(&self) -> Devices {
        Devices::for_accelerator(self.accelerator, self.gpu)
    }

    /// Hyperparameter snapshot recorded with the run, merged with the model configuration.
    pub fn hyperparams(&self, model: &ModelConfig) -> Result<Map<String, Value>, MlError> {
        let mut params = Map::new();
        params.insert("IMG_SIZE".into(), json!(self.image_size));
        params.insert("RESOLUTION".into(), json!(self.resolution));
        params.insert("BATCH_SIZE".into(), json!(self.batch_size));
        params.insert("LR".into(), json!(self.lr));
        params.insert("SEED".into(), json!(self.seed));
        params.insert("ANATOMY".into(), json!(self.anatomy.as_str()));
        params.insert(MODEL_NAME_KEY.into(), json!(self.architecture.name()));
        params.insert("LOSS".into(), json!(self.loss.name()));
        params.insert("EXPERIMENT_NAME".into(), json!(self.experiment.name()));
        params.extend(model.to_mapping()?);
        Ok(params)
    }
}

/// Raw `evaluate` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluateArgs {
    pub testpaths: PathBuf,
    pub model_name: String,
    /// Checkpoint file, or a checkpoint directory to take the latest from.
    pub ckpt_path: PathBuf,
    pub res: f64,
    pub load_autoencoder_from: Option<PathBuf>,
    /// Falls back to `evaluation.nsd_tolerance`.
    pub nsd_tolerance: Option<f64>,
    pub image_size: usize,
    pub output_path: Option<PathBuf>,
    pub batch_size: usize,
    pub num_workers: usize,
    pub accelerator: Accelerator,
    pub precision: Option<u8>,
    pub gpu: usize,
}

impl Default for EvaluateArgs {
    fn default() -> Self {
        Self {
            testpaths: PathBuf::new(),
            model_name: String::new(),
            ckpt_path: PathBuf::new(),
            res: 1.5,
            load_autoencoder_from: None,
            nsd_tolerance: None,
            image_size: 64,
            output_path: None,
            batch_size: 2,
            num_workers: 20,
            accelerator: Accelerator::Gpu,
            precision: None,
            gpu: 0,
        }
    }
}

/// Fully resolved evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationPlan {
    pub testpaths: PathBuf,
    pub architecture: Architecture,
    pub experiment: ExperimentKind,
    /// Concrete checkpoint file.
    pub checkpoint: PathBuf,
    pub resolution: f64,
    pub image_size: usize,
    pub nsd_tolerance: f64,
    pub output_dir: PathBuf,
    pub metric_log_name: String,
    pub batch_size: usize,
    pub num_workers: usize,
    pub accelerator: Accelerator,
    pub devices: Devices,
    pub precision: u8,
    pub autoencoder_checkpoint: Option<PathBuf>,
}

impl EvaluationPlan {
    pub fn resolve(args: EvaluateArgs, config: &XrayConfig) -> Result<Self, MlError> {
        let architecture: Architecture = args.model_name.parse()?;
        let experiment = ExperimentKind::for_architecture(architecture);
        let autoencoder_checkpoint = match (experiment, args.load_autoencoder_from) {
            (ExperimentKind::TlPredictor, None) => {
                return Err(MlError::invalid_input(format!(
                    "{architecture} requires --load-autoencoder-from"
                )));
            }
            (ExperimentKind::TlPredictor, Some(path)) => Some(path),
            (_, _) => None,
        };
        if args.batch_size == 0 {
            return Err(MlError::invalid_input("batch size must be at least 1"));
        }

        let checkpoint = resolve_checkpoint(&args.ckpt_path)?;
        let output_dir = match args.output_path {
            Some(dir) => dir,
            None => default_output_dir(&args.ckpt_path),
        };

        Ok(Self {
            testpaths: args.testpaths,
            architecture,
            experiment,
            checkpoint,
            resolution: args.res,
            image_size: args.image_size,
            nsd_tolerance: args
                .nsd_tolerance
                .unwrap_or(config.evaluation.nsd_tolerance),
            output_dir,
            metric_log_name: config.paths.metric_log_name.clone(),
            batch_size: args.batch_size,
            num_workers: args.num_workers,
            accelerator: args.accelerator,
            devices: Devices::for_accelerator(args.accelerator, args.gpu),
            precision: evaluation_precision(args.precision, args.gpu),
            autoencoder_checkpoint,
        })
    }

    pub fn metric_log_path(&self) -> PathBuf {
        self.output_dir.join(&self.metric_log_name)
    }
}

/// `evaluation/` next to the checkpoint directory.
fn default_output_dir(ckpt_path: &Path) -> PathBuf {
    let ckpt_dir = if ckpt_path.is_dir() {
        ckpt_path
    } else {
        ckpt_path.parent().unwrap_or(Path::new("."))
    };
    ckpt_dir
        .parent()
        .unwrap_or(Path::new("."))
        .join("evaluation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoo::model_config;
    use tempfile::TempDir;

    fn femur_args(model: &str) -> TrainArgs {
        TrainArgs {
            trainpaths: PathBuf::from("configs/paths/femur/TotalSeg-femur-left_train.csv"),
            valpaths: PathBuf::from("configs/paths/femur/TotalSeg-femur-left_val.csv"),
            model_name: model.to_string(),
            loss: "DiceLoss".to_string(),
            size: 64,
            res: 2.0,
            tags: vec!["baseline".to_string()],
            ..TrainArgs::default()
        }
    }

    #[test]
    fn test_resolve_train_plan() {
        let plan = TrainingPlan::resolve(femur_args("Unet"), &XrayConfig::default()).unwrap();
        assert_eq!(plan.anatomy, Anatomy::Femur);
        assert_eq!(plan.experiment, ExperimentKind::VolumeAsInput);
        assert_eq!(plan.tags, vec!["Unet", "femur", "DiceLoss", "baseline"]);
        assert_eq!(plan.group, "Unet");
        assert_eq!(plan.precision, 16);
        assert_eq!(plan.project, "2d-3d-benchmark");
        assert_eq!(plan.max_steps, None);
        assert_eq!(plan.top_k_checkpoints, Some(1));
        assert_eq!(plan.seed, 12345);
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let mut args = femur_args("Unet");
        args.res = 1.5;
        let err = TrainingPlan::resolve(args, &XrayConfig::default()).unwrap_err();
        assert!(matches!(err, MlError::InvalidInput(_)));
    }

    #[test]
    fn test_precision_rules() {
        assert_eq!(default_precision(None, 0), 16);
        assert_eq!(default_precision(None, 1), 32);
        assert_eq!(default_precision(Some(32), 0), 32);
    }

    #[test]
    fn test_evaluation_forces_half_precision_on_first_gpu() {
        assert_eq!(evaluation_precision(Some(32), 0), 16);
        assert_eq!(evaluation_precision(None, 0), 16);
        assert_eq!(evaluation_precision(Some(32), 1), 32);
        assert_eq!(evaluation_precision(Some(16), 2), 16);
        assert_eq!(evaluation_precision(None, 1), 32);
    }

    #[test]
    fn test_tl_predictor_requires_autoencoder() {
        let err = TrainingPlan::resolve(femur_args("TLPredictor"), &XrayConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("--load-autoencoder-from"));

        let mut args = femur_args("TLPredictor");
        args.load_autoencoder_from = Some(PathBuf::from("runs/ae/last.safetensors"));
        let plan = TrainingPlan::resolve(args, &XrayConfig::default()).unwrap();
        assert_eq!(plan.experiment, ExperimentKind::TlPredictor);
    }

    #[test]
    fn test_make_sparse_only_for_autoencoder() {
        let mut args = femur_args("Unet");
        args.make_sparse = true;
        assert!(TrainingPlan::resolve(args, &XrayConfig::default()).is_err());

        let mut args = femur_args("CustomAutoEncoder");
        args.make_sparse = true;
        assert!(TrainingPlan::resolve(args, &XrayConfig::default()).unwrap().make_sparse);
    }

    #[test]
    fn test_unknown_names_rejected() {
        let mut args = femur_args("ResNet");
        assert!(TrainingPlan::resolve(args.clone(), &XrayConfig::default()).is_err());
        args.model_name = "Unet".to_string();
        args.loss = "FocalLoss".to_string();
        assert!(TrainingPlan::resolve(args, &XrayConfig::default()).is_err());
    }

    #[test]
    fn test_hyperparams_include_model_config() {
        let plan = TrainingPlan::resolve(femur_args("Unet"), &XrayConfig::default()).unwrap();
        let config = model_config(Architecture::Unet, 64, false).unwrap();
        let params = plan.hyperparams(&config).unwrap();
        assert_eq!(params["MODEL_NAME"], json!("Unet"));
        assert_eq!(params["ANATOMY"], json!("femur"));
        assert_eq!(params["EXPERIMENT_NAME"], json!("VolumeAsInputExperiment"));
        assert_eq!(params["IMG_SIZE"], json!(64));
        assert!(params.len() > 9);
    }

    #[test]
    fn test_resolve_evaluation_plan() {
        let dir = TempDir::new().unwrap();
        let ckpt_dir = dir.path().join("run").join("checkpoints");
        std::fs::create_dir_all(&ckpt_dir).unwrap();
        std::fs::write(ckpt_dir.join("last.safetensors"), b"").unwrap();

        let args = EvaluateArgs {
            testpaths: PathBuf::from("femur_test.csv"),
            model_name: "Unet".to_string(),
            ckpt_path: ckpt_dir.clone(),
            accelerator: Accelerator::Cpu,
            gpu: 1,
            ..EvaluateArgs::default()
        };
        let plan = EvaluationPlan::resolve(args, &XrayConfig::default()).unwrap();
        assert_eq!(plan.checkpoint, ckpt_dir.join("last.safetensors"));
        assert_eq!(plan.output_dir, dir.path().join("run").join("evaluation"));
        assert_eq!(plan.precision, 32);
        assert_eq!(plan.nsd_tolerance, 1.5);
        assert!(matches!(plan.devices, Devices::Count(n) if n >= 1));
        assert_eq!(
            plan.metric_log_path(),
            dir.path().join("run").join("evaluation").join("metric-log.csv")
        );
    }

    #[test]
    fn test_accelerator_parse() {
        assert_eq!("GPU".parse::<Accelerator>().unwrap(), Accelerator::Gpu);
        assert_eq!("cpu".parse::<Accelerator>().unwrap(), Accelerator::Cpu);
        assert!("tpu".parse::<Accelerator>().is_err());
    }
}
