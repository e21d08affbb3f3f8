//! Training and evaluation orchestration: plans, trainer jobs, backends, metrics and
//! reproducibility snapshots.

pub mod backend;
pub mod driver;
pub mod job;
pub mod metrics;
pub mod plan;
pub mod reproducibility;

pub use backend::{PythonTrainer, TrainerBackend};
pub use driver::{EvaluationOutcome, TrainingOutcome, run_evaluation, run_training};
pub use job::{DescribeJob, EvalJob, PredictionOutcome, SmokeReport, TrainJob};
pub use metrics::TrainingMetrics;
pub use plan::{Accelerator, Devices, EvaluateArgs, EvaluationPlan, TrainArgs, TrainingPlan};
pub use reproducibility::EnvironmentSnapshot;
