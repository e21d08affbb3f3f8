//! Rewriting trainer checkpoints so their weights load into bare networks.
//!
//! A trainer checkpoint nests the network under `model.` and carries loss buffers
//! next to it. Grafting a pretrained autoencoder into the transfer-learning
//! predictor needs those paths stripped back to the network's own namespace.

use crate::checkpoint::path::ParamPath;
use crate::checkpoint::state_dict::{Checkpoint, StateDict};
use crate::error::MlError;
use crate::zoo::{Architecture, LoadReport, ModelLayout, Network, build_model};
use std::path::Path;
use tracing::{debug, info, warn};

/// One rewrite step over a parameter path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRule {
    /// Remove a leading prefix when present.
    StripPrefix(ParamPath),
    /// Discard the entry at this path and everything nested under it.
    Drop(ParamPath),
}

/// What a plan did to a state dict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransplantSummary {
    pub kept: usize,
    pub renamed: usize,
    pub dropped: Vec<String>,
}

/// Ordered rewrite rules applied to every key of a state dict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransplantPlan {
    rules: Vec<PathRule>,
}

impl TransplantPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule: PathRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[PathRule] {
        &self.rules
    }

    /// Rules for checkpoints written by the trainer module wrapper.
    ///
    /// Every loss buffer lives under `loss_function`, whichever loss was trained with.
    pub fn trainer_module() -> Result<Self, MlError> {
        Ok(Self::new()
            .rule(PathRule::StripPrefix("model".parse()?))
            .rule(PathRule::Drop("loss_function".parse()?)))
    }

    /// Apply the rules in order to every key.
    ///
    /// Fails when two source keys rewrite to the same destination.
    pub fn apply(&self, state: StateDict) -> Result<(StateDict, TransplantSummary), MlError> {
        let mut out = StateDict::new();
        let mut summary = TransplantSummary::default();

        'keys: for (path, tensor) in state {
            let original = path.clone();
            let mut current = path;
            for rule in &self.rules {
                match rule {
                    PathRule::StripPrefix(prefix) => {
                        if let Some(stripped) = current.strip_prefix(prefix) {
                            current = stripped;
                        }
                    }
                    PathRule::Drop(target) => {
                        if current.starts_with(target) {
                            summary.dropped.push(original.to_string());
                            continue 'keys;
                        }
                    }
                }
            }
            if current != original {
                summary.renamed += 1;
            }
            if out.contains(&current) {
                return Err(MlError::checkpoint(format!(
                    "rewriting {original} collides with existing key {current}"
                )));
            }
            out.insert(current, tensor);
            summary.kept += 1;
        }

        Ok((out, summary))
    }
}

/// Read a checkpoint file. A missing file fails before any bytes are read.
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint, MlError> {
    if !path.is_file() {
        return Err(MlError::not_found(format!(
            "checkpoint {} does not exist",
            path.display()
        )));
    }
    let bytes = std::fs::read(path)?;
    let checkpoint = Checkpoint::from_bytes(&bytes).map_err(|e| {
        MlError::checkpoint(format!("failed to decode {}: {e}", path.display()))
    })?;
    debug!(
        path = %path.display(),
        tensors = checkpoint.state_dict.len(),
        "Loaded checkpoint"
    );
    Ok(checkpoint)
}

fn rewritten_state(path: &Path) -> Result<StateDict, MlError> {
    let checkpoint = load_checkpoint(path)?;
    let (state, summary) = TransplantPlan::trainer_module()?.apply(checkpoint.state_dict)?;
    debug!(
        kept = summary.kept,
        renamed = summary.renamed,
        dropped = ?summary.dropped,
        "Rewrote checkpoint keys"
    );
    Ok(state)
}

/// Load a trained autoencoder from a trainer checkpoint, strictly.
///
/// Keys are checked against `layout`, the names the trainer reported for the
/// autoencoder at this image size.
pub fn transplant_autoencoder(
    path: &Path,
    image_size: usize,
    layout: ModelLayout,
) -> Result<Network, MlError> {
    let state = rewritten_state(path)?;
    let mut autoencoder = build_model(Architecture::CustomAutoEncoder, image_size, false)?;
    autoencoder.adopt_layout(layout)?;
    let report = autoencoder.load_state_dict(state, true)?;
    info!(
        path = %path.display(),
        tensors = report.loaded,
        "Loaded autoencoder weights"
    );
    Ok(autoencoder)
}

/// Load predictor weights from a trainer checkpoint, tolerating key differences.
pub fn transplant_predictor(path: &Path, network: &mut Network) -> Result<LoadReport, MlError> {
    let state = rewritten_state(path)?;
    let report = network.load_state_dict(state, false)?;
    if !report.is_exact() {
        warn!(
            model = %network.architecture(),
            missing = report.missing.len(),
            unexpected = report.unexpected.len(),
            "Predictor checkpoint does not match the model exactly"
        );
    }
    Ok(report)
}
