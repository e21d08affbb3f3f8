//! Model zoo: architecture names, configuration tables and network descriptors.

pub mod architecture;
pub mod config;
pub mod factory;
pub mod network;

pub use architecture::Architecture;
pub use config::{ModelConfig, model_config};
pub use factory::{build_model, build_model_by_name};
pub use network::{LoadReport, ModelLayout, Network};
