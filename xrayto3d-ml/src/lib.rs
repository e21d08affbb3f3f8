//! # xrayto3d-ml: biplanar X-ray to 3D bone shape experiment harness
//!
//! Model configuration tables, loss selection, checkpoint transplanting, training and
//! evaluation job orchestration, and benchmark table generation for the
//! biplanar-X-ray-to-3D-segmentation model family.
//!
//! Networks are described, not executed: the crate resolves configurations, parameter
//! layouts and weights, and hands fully specified jobs to an external trainer process.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;
pub mod runtime;

// Domain tables
pub mod anatomy;
pub mod losses;
pub mod zoo;

// Weights
pub mod checkpoint;

// Data and experiments
pub mod data;
pub mod experiments;

// Orchestration
pub mod training;

// Tracking and reporting
pub mod benchmark;
pub mod tracking;

// Re-exports
pub use anatomy::Anatomy;
pub use benchmark::{BenchmarkReport, BenchmarkReporter, BenchmarkRequest, EvaluationScope};
pub use config::{XrayConfig, load_config};
pub use error::MlError;
pub use losses::{LossFunction, LossKind, build_loss};
pub use runtime::PythonRuntime;
pub use zoo::{Architecture, Network, build_model, build_model_by_name};
