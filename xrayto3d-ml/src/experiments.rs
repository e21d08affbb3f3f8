//! Experiment wrappers: which training/inference scheme the trainer runs for a model.

use crate::data::{InputLayout, TransformSpec};
use crate::error::MlError;
use crate::losses::{LossFunction, LossSpec};
use crate::zoo::{Architecture, ModelConfig, Network};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Experiment wrapper kind run by the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentKind {
    #[serde(rename = "ParallelHeadsExperiment")]
    ParallelHeads,
    #[serde(rename = "VolumeAsInputExperiment")]
    VolumeAsInput,
    #[serde(rename = "AutoencoderExperiment")]
    Autoencoder,
    #[serde(rename = "TLPredictorExperiment")]
    TlPredictor,
}

impl ExperimentKind {
    pub fn for_architecture(arch: Architecture) -> Self {
        match arch {
            Architecture::OneDConcatModel
            | Architecture::TwoDPermuteConcatModel
            | Architecture::MultiScale2DPermuteConcat => ExperimentKind::ParallelHeads,
            Architecture::Unet | Architecture::AttentionUnet => ExperimentKind::VolumeAsInput,
            Architecture::CustomAutoEncoder => ExperimentKind::Autoencoder,
            Architecture::TlPredictor => ExperimentKind::TlPredictor,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExperimentKind::ParallelHeads => "ParallelHeadsExperiment",
            ExperimentKind::VolumeAsInput => "VolumeAsInputExperiment",
            ExperimentKind::Autoencoder => "AutoencoderExperiment",
            ExperimentKind::TlPredictor => "TLPredictorExperiment",
        }
    }

    /// How samples are presented to the network.
    pub fn input_layout(&self) -> InputLayout {
        match self {
            ExperimentKind::ParallelHeads | ExperimentKind::TlPredictor => {
                InputLayout::SeparateViews
            }
            ExperimentKind::VolumeAsInput => InputLayout::BackprojectedVolume,
            ExperimentKind::Autoencoder => InputLayout::SegmentationVolume,
        }
    }

    /// Preprocessing for this experiment at the given geometry.
    pub fn transforms(&self, image_size: usize, resolution: f64) -> TransformSpec {
        TransformSpec::new(self.input_layout(), image_size, resolution)
    }
}

impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Optimizer settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum OptimizerSpec {
    Adam { lr: f64 },
}

/// A network wrapped with everything the trainer needs to fit or predict with it.
#[derive(Debug, Clone)]
pub struct Experiment {
    kind: ExperimentKind,
    model: Network,
    loss: Option<LossFunction>,
    optimizer: Option<OptimizerSpec>,
    batch_size: Option<usize>,
    decoder: Option<Network>,
    make_sparse: bool,
}

impl Experiment {
    pub fn for_training(
        model: Network,
        optimizer: OptimizerSpec,
        loss: LossFunction,
        batch_size: usize,
    ) -> Self {
        Self {
            kind: ExperimentKind::for_architecture(model.architecture()),
            model,
            loss: Some(loss),
            optimizer: Some(optimizer),
            batch_size: Some(batch_size),
            decoder: None,
            make_sparse: false,
        }
    }

    pub fn for_inference(model: Network) -> Self {
        Self {
            kind: ExperimentKind::for_architecture(model.architecture()),
            model,
            loss: None,
            optimizer: None,
            batch_size: None,
            decoder: None,
            make_sparse: false,
        }
    }

    pub fn kind(&self) -> ExperimentKind {
        self.kind
    }

    pub fn model(&self) -> &Network {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Network {
        &mut self.model
    }

    /// Attach the pretrained autoencoder whose latent space the predictor targets.
    pub fn set_decoder(&mut self, autoencoder: Network) -> Result<(), MlError> {
        if self.kind != ExperimentKind::TlPredictor {
            return Err(MlError::invalid_input(format!(
                "{} does not take a decoder",
                self.kind
            )));
        }
        if autoencoder.architecture() != Architecture::CustomAutoEncoder {
            return Err(MlError::invalid_input(format!(
                "decoder must be a {}, got {}",
                Architecture::CustomAutoEncoder,
                autoencoder.architecture()
            )));
        }
        let predictor_dim = self.model.config().latent_dim();
        let decoder_dim = autoencoder.config().latent_dim();
        if predictor_dim != decoder_dim {
            return Err(MlError::invalid_input(format!(
                "latent size mismatch: predictor {predictor_dim:?}, autoencoder {decoder_dim:?}"
            )));
        }
        self.decoder = Some(autoencoder);
        Ok(())
    }

    /// Toggle the sparsity penalty on the autoencoder latent code.
    pub fn set_make_sparse(&mut self, make_sparse: bool) -> Result<(), MlError> {
        if make_sparse && self.kind != ExperimentKind::Autoencoder {
            return Err(MlError::invalid_input(format!(
                "{} has no latent code to sparsify",
                self.kind
            )));
        }
        self.make_sparse = make_sparse;
        Ok(())
    }

    /// Serializable description for the trainer job.
    pub fn spec(&self, decoder_checkpoint: Option<PathBuf>) -> ExperimentSpec {
        ExperimentSpec {
            kind: self.kind,
            model: ModelSpec::of(&self.model),
            loss: self.loss.as_ref().map(LossFunction::spec),
            optimizer: self.optimizer,
            batch_size: self.batch_size,
            make_sparse: self.make_sparse,
            decoder: self.decoder.as_ref().map(ModelSpec::of),
            decoder_checkpoint,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    pub architecture: Architecture,
    pub image_size: usize,
    pub config: ModelConfig,
    pub parameter_count: usize,
}

impl ModelSpec {
    pub fn of(network: &Network) -> Self {
        Self {
            architecture: network.architecture(),
            image_size: network.image_size(),
            config: network.config().clone(),
            parameter_count: network.parameter_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSpec {
    pub kind: ExperimentKind,
    pub model: ModelSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<LossSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    pub make_sparse: bool,
    /// The pretrained autoencoder a transfer-learning predictor decodes with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoder: Option<ModelSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoder_checkpoint: Option<PathBuf>,
}
