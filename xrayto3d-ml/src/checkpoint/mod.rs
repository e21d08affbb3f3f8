//! Checkpoint files: parameter paths, safetensors state dicts, key rewriting and
//! on-disk retention.

pub mod manager;
pub mod path;
pub mod state_dict;
pub mod transplant;

pub use manager::{CheckpointManager, CheckpointTag, resolve_checkpoint};
pub use path::ParamPath;
pub use state_dict::{Checkpoint, StateDict, TensorRecord};
pub use transplant::{
    PathRule, TransplantPlan, load_checkpoint, transplant_autoencoder, transplant_predictor,
};
