//! Per-architecture network configuration.
//!
//! Values are fixed tables keyed by architecture, input image size and the dropout
//! flag. Every configuration is validated on construction so that stage lists with
//! mismatched lengths are rejected here rather than deep inside the trainer.

use crate::error::MlError;
use crate::zoo::architecture::Architecture;
use serde::{Deserialize, Serialize};

/// Activation layer selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Activation {
    Relu,
}

/// Normalization layer selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Norm {
    Batch,
}

/// Convolution stride: one value for every axis, or one per axis of a 3D volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Stride {
    Uniform(usize),
    PerAxis([usize; 3]),
}

impl Stride {
    /// Down-sampling factor when the stride is the same along every axis.
    pub fn uniform(&self) -> Option<usize> {
        match self {
            Stride::Uniform(s) => Some(*s),
            Stride::PerAxis([a, b, c]) if a == b && b == c => Some(*a),
            Stride::PerAxis(_) => None,
        }
    }
}

/// Kernel size shared by all stages or given per stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KernelSize {
    Uniform(usize),
    PerStage(Vec<usize>),
}

impl KernelSize {
    pub fn at(&self, stage: usize) -> Option<usize> {
        match self {
            KernelSize::Uniform(k) => Some(*k),
            KernelSize::PerStage(ks) => ks.get(stage).copied(),
        }
    }
}

/// One stack of convolution stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageBlock {
    pub in_channels: Vec<usize>,
    pub out_channels: Vec<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strides: Vec<Stride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_size: Option<KernelSize>,
}

impl StageBlock {
    fn new(in_channels: Vec<usize>, out_channels: Vec<usize>) -> Self {
        Self {
            in_channels,
            out_channels,
            strides: Vec::new(),
            kernel_size: None,
        }
    }

    fn strides(mut self, strides: Vec<Stride>) -> Self {
        self.strides = strides;
        self
    }

    fn kernel(mut self, kernel: KernelSize) -> Self {
        self.kernel_size = Some(kernel);
        self
    }

    pub fn depth(&self) -> usize {
        self.out_channels.len()
    }

    /// Check that every stage list has one entry per stage.
    pub fn validate(&self, name: &str) -> Result<(), MlError> {
        let depth = self.depth();
        if depth == 0 {
            return Err(MlError::invalid_input(format!("{name}: no stages")));
        }
        if self.in_channels.len() != depth {
            return Err(MlError::invalid_input(format!(
                "{name}: {} in_channels for {depth} stages",
                self.in_channels.len()
            )));
        }
        if !self.strides.is_empty() && self.strides.len() != depth {
            return Err(MlError::invalid_input(format!(
                "{name}: {} strides for {depth} stages",
                self.strides.len()
            )));
        }
        if let Some(KernelSize::PerStage(ks)) = &self.kernel_size {
            if ks.len() != depth {
                return Err(MlError::invalid_input(format!(
                    "{name}: {} kernel sizes for {depth} stages",
                    ks.len()
                )));
            }
        }
        if self.in_channels.iter().chain(&self.out_channels).any(|&c| c == 0) {
            return Err(MlError::invalid_input(format!("{name}: zero channel count")));
        }
        Ok(())
    }

    /// Stride for a stage, 1 when the block carries none.
    pub fn stride_at(&self, stage: usize) -> Stride {
        self.strides.get(stage).copied().unwrap_or(Stride::Uniform(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub channels: Vec<usize>,
    pub strides: Vec<usize>,
    pub act: Activation,
    pub norm: Norm,
    pub num_res_units: usize,
    pub dropout: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionUnetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub channels: Vec<usize>,
    pub strides: Vec<usize>,
}

/// Multi-scale 2D encoder: `encoder_count` parallel stacks per view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiScaleEncoder {
    pub in_channels: Vec<usize>,
    pub out_channels: Vec<usize>,
    pub encoder_count: usize,
    pub kernel_size: usize,
    pub act: Activation,
    pub norm: Norm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvStack {
    pub in_channels: Vec<usize>,
    pub out_channels: Vec<usize>,
    pub kernel_size: usize,
    pub act: Activation,
    pub norm: Norm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiScaleConfig {
    pub encoder: MultiScaleEncoder,
    #[serde(rename = "decoder_2D")]
    pub decoder_2d: ConvStack,
    #[serde(rename = "fusion_3D")]
    pub fusion_3d: ConvStack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoDPermuteConcatConfig {
    pub input_image_size: [usize; 2],
    pub encoder: StageBlock,
    pub ap_expansion: StageBlock,
    pub lat_expansion: StageBlock,
    pub decoder: StageBlock,
    pub act: Activation,
    pub norm: Norm,
    pub dropout: f64,
    pub bias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneDConcatConfig {
    pub input_image_size: [usize; 2],
    pub encoder: StageBlock,
    pub decoder: StageBlock,
    pub kernel_size: usize,
    pub act: Activation,
    pub norm: Norm,
    pub dropout: f64,
    pub bias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoEncoderConfig {
    pub image_size: usize,
    pub latent_dim: usize,
    pub encoder: StageBlock,
    pub decoder: StageBlock,
    pub kernel_size: usize,
    pub act: Activation,
    pub norm: Norm,
    pub dropout: f64,
    pub bias: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlPredictorConfig {
    pub input_image_size: [usize; 2],
    pub latent_dim: usize,
    pub encoder: StageBlock,
    pub kernel_size: usize,
    pub act: Activation,
    pub norm: Norm,
    pub dropout: f64,
    pub bias: bool,
}

/// Configuration for any supported architecture.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ModelConfig {
    Unet(UnetConfig),
    AttentionUnet(AttentionUnetConfig),
    MultiScale2DPermuteConcat(MultiScaleConfig),
    TwoDPermuteConcat(TwoDPermuteConcatConfig),
    OneDConcat(OneDConcatConfig),
    AutoEncoder(AutoEncoderConfig),
    TlPredictor(TlPredictorConfig),
}

impl ModelConfig {
    pub fn architecture(&self) -> Architecture {
        match self {
            ModelConfig::Unet(_) => Architecture::Unet,
            ModelConfig::AttentionUnet(_) => Architecture::AttentionUnet,
            ModelConfig::MultiScale2DPermuteConcat(_) => Architecture::MultiScale2DPermuteConcat,
            ModelConfig::TwoDPermuteConcat(_) => Architecture::TwoDPermuteConcatModel,
            ModelConfig::OneDConcat(_) => Architecture::OneDConcatModel,
            ModelConfig::AutoEncoder(_) => Architecture::CustomAutoEncoder,
            ModelConfig::TlPredictor(_) => Architecture::TlPredictor,
        }
    }

    /// Latent vector size for the autoencoder / predictor pair.
    pub fn latent_dim(&self) -> Option<usize> {
        match self {
            ModelConfig::AutoEncoder(c) => Some(c.latent_dim),
            ModelConfig::TlPredictor(c) => Some(c.latent_dim),
            _ => None,
        }
    }

    /// Structural consistency of the stage lists.
    pub fn validate(&self) -> Result<(), MlError> {
        match self {
            ModelConfig::Unet(c) => {
                validate_unet_levels("Unet", &c.channels, &c.strides)?;
                if c.num_res_units == 0 {
                    return Err(MlError::invalid_input("Unet: num_res_units must be >= 1"));
                }
                Ok(())
            }
            ModelConfig::AttentionUnet(c) => {
                validate_unet_levels("AttentionUnet", &c.channels, &c.strides)
            }
            ModelConfig::MultiScale2DPermuteConcat(c) => {
                if c.encoder.in_channels.len() != c.encoder.out_channels.len() {
                    return Err(MlError::invalid_input(
                        "MultiScale2DPermuteConcat: encoder channel lists differ in length",
                    ));
                }
                if c.encoder.encoder_count == 0 {
                    return Err(MlError::invalid_input(
                        "MultiScale2DPermuteConcat: encoder_count must be >= 1",
                    ));
                }
                for (name, stack) in [("decoder_2D", &c.decoder_2d), ("fusion_3D", &c.fusion_3d)] {
                    if stack.in_channels.len() != stack.out_channels.len() {
                        return Err(MlError::invalid_input(format!(
                            "MultiScale2DPermuteConcat: {name} channel lists differ in length"
                        )));
                    }
                }
                Ok(())
            }
            ModelConfig::TwoDPermuteConcat(c) => {
                c.encoder.validate("TwoDPermuteConcatModel.encoder")?;
                c.ap_expansion.validate("TwoDPermuteConcatModel.ap_expansion")?;
                c.lat_expansion.validate("TwoDPermuteConcatModel.lat_expansion")?;
                c.decoder.validate("TwoDPermuteConcatModel.decoder")
            }
            ModelConfig::OneDConcat(c) => {
                c.encoder.validate("OneDConcatModel.encoder")?;
                c.decoder.validate("OneDConcatModel.decoder")?;
                if c.decoder.strides.len() != c.decoder.out_channels.len() {
                    return Err(MlError::invalid_input(
                        "OneDConcatModel.decoder: strides must cover every stage",
                    ));
                }
                Ok(())
            }
            ModelConfig::AutoEncoder(c) => {
                c.encoder.validate("CustomAutoEncoder.encoder")?;
                c.decoder.validate("CustomAutoEncoder.decoder")
            }
            ModelConfig::TlPredictor(c) => c.encoder.validate("TLPredictor.encoder"),
        }
    }

    /// Flatten into a `{parameter: value}` mapping for hyperparameter logging.
    pub fn to_mapping(&self) -> Result<serde_json::Map<String, serde_json::Value>, MlError> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(MlError::invalid_input(format!(
                "model configuration serialized to {other} instead of a mapping"
            ))),
        }
    }
}

fn validate_unet_levels(name: &str, channels: &[usize], strides: &[usize]) -> Result<(), MlError> {
    if channels.len() < 2 {
        return Err(MlError::invalid_input(format!(
            "{name}: needs at least two channel levels"
        )));
    }
    if strides.len() != channels.len() - 1 {
        return Err(MlError::invalid_input(format!(
            "{name}: {} strides for {} channel levels",
            strides.len(),
            channels.len()
        )));
    }
    Ok(())
}

/// Length of the flattened feature vector after a strided encoder:
/// `(image_size / prod(strides))^spatial_dims * last_channels`.
pub fn embedding_size(
    image_size: usize,
    strides: &[Stride],
    last_channels: usize,
    spatial_dims: u32,
) -> Result<usize, MlError> {
    let mut factor = 1usize;
    for stride in strides {
        let s = stride.uniform().ok_or_else(|| {
            MlError::invalid_input(format!("anisotropic stride {stride:?} cannot be flattened"))
        })?;
        factor = factor.saturating_mul(s);
    }
    if factor == 0 || image_size == 0 || image_size % factor != 0 {
        return Err(MlError::invalid_input(format!(
            "image size {image_size} is not divisible by total encoder stride {factor}"
        )));
    }
    let side = image_size / factor;
    let size = side.pow(spatial_dims) * last_channels;
    if size == 0 {
        return Err(MlError::invalid_input(format!(
            "encoder for image size {image_size} flattens to an empty embedding"
        )));
    }
    Ok(size)
}

fn require_size(arch: Architecture, image_size: usize) -> Result<(), MlError> {
    if image_size == 64 || image_size == 128 {
        Ok(())
    } else {
        Err(MlError::invalid_input(format!(
            "{arch} supports image sizes 64 and 128, got {image_size}"
        )))
    }
}

fn uniform(values: &[usize]) -> Vec<Stride> {
    values.iter().map(|&s| Stride::Uniform(s)).collect()
}

fn per_axis(axes: [usize; 3], count: usize) -> Vec<Stride> {
    vec![Stride::PerAxis(axes); count]
}

fn unet(dropout: bool) -> UnetConfig {
    UnetConfig {
        in_channels: 2,
        out_channels: 1,
        channels: vec![8, 16, 32, 64, 128],
        strides: vec![2, 2, 2, 2],
        act: Activation::Relu,
        norm: Norm::Batch,
        num_res_units: 2,
        dropout: if dropout { 0.1 } else { 0.0 },
    }
}

fn attention_unet() -> AttentionUnetConfig {
    AttentionUnetConfig {
        in_channels: 2,
        out_channels: 1,
        channels: vec![8, 16, 32, 64, 64],
        strides: vec![2, 2, 2, 2],
    }
}

fn multiscale_2d_permute_concat() -> MultiScaleConfig {
    MultiScaleConfig {
        encoder: MultiScaleEncoder {
            in_channels: vec![16, 32],
            out_channels: vec![4, 8],
            encoder_count: 4,
            kernel_size: 3,
            act: Activation::Relu,
            norm: Norm::Batch,
        },
        decoder_2d: ConvStack {
            in_channels: vec![64, 96],
            out_channels: vec![64, 128],
            kernel_size: 3,
            act: Activation::Relu,
            norm: Norm::Batch,
        },
        fusion_3d: ConvStack {
            in_channels: vec![2, 34],
            out_channels: vec![32, 32],
            kernel_size: 3,
            act: Activation::Relu,
            norm: Norm::Batch,
        },
    }
}

fn two_d_permute_concat(image_size: usize) -> Result<TwoDPermuteConcatConfig, MlError> {
    require_size(Architecture::TwoDPermuteConcatModel, image_size)?;
    // Both supported sizes share one decoder layout.
    let decoder = StageBlock::new(
        vec![64, 64, 64, 64, 64, 32, 16],
        vec![64, 64, 64, 64, 32, 16, 1],
    )
    .strides(uniform(&[1, 1, 1, 1, 2, 2, 1]))
    .kernel(KernelSize::PerStage(vec![3, 3, 3, 3, 3, 3, 7]));

    Ok(TwoDPermuteConcatConfig {
        input_image_size: [image_size, image_size],
        encoder: StageBlock::new(vec![1, 16, 32, 32, 32, 32], vec![16, 32, 32, 32, 32, 32])
            .strides(uniform(&[2, 2, 1, 1, 1, 1]))
            .kernel(KernelSize::Uniform(7)),
        ap_expansion: StageBlock::new(vec![32; 4], vec![32; 4])
            .strides(per_axis([2, 1, 1], 4))
            .kernel(KernelSize::Uniform(3)),
        lat_expansion: StageBlock::new(vec![32; 4], vec![32; 4])
            .strides(per_axis([1, 1, 2], 4))
            .kernel(KernelSize::Uniform(3)),
        decoder,
        act: Activation::Relu,
        norm: Norm::Batch,
        dropout: 0.0,
        bias: false,
    })
}

fn one_d_concat(image_size: usize) -> Result<OneDConcatConfig, MlError> {
    require_size(Architecture::OneDConcatModel, image_size)?;
    let encoder = StageBlock::new(vec![1, 32, 64, 128, 256], vec![32, 64, 128, 256, 256])
        .strides(uniform(&[2; 5]));

    let (mut decoder_in, decoder_out, decoder_strides) = if image_size == 128 {
        (
            vec![1024, 512, 8, 4, 4, 4],
            vec![1024, 512, 8, 4, 4, 4, 1],
            uniform(&[2; 7]),
        )
    } else {
        (
            vec![1024, 512, 8, 4, 4],
            vec![1024, 512, 8, 4, 4, 1],
            uniform(&[2; 6]),
        )
    };

    let last_channels = encoder.out_channels.last().copied().unwrap_or_default();
    let embedding = embedding_size(image_size, &encoder.strides, last_channels, 2)?;
    decoder_in.insert(0, embedding);

    Ok(OneDConcatConfig {
        input_image_size: [image_size, image_size],
        encoder,
        decoder: StageBlock::new(decoder_in, decoder_out).strides(decoder_strides),
        kernel_size: 3,
        act: Activation::Relu,
        norm: Norm::Batch,
        dropout: 0.0,
        bias: true,
    })
}

fn custom_autoencoder(image_size: usize) -> Result<AutoEncoderConfig, MlError> {
    require_size(Architecture::CustomAutoEncoder, image_size)?;
    Ok(AutoEncoderConfig {
        image_size,
        latent_dim: 64,
        encoder: StageBlock::new(vec![1, 8, 16, 32, 64], vec![8, 16, 32, 64, 128])
            .strides(uniform(&[2; 5])),
        decoder: StageBlock::new(vec![128, 64, 32, 16, 8], vec![64, 32, 16, 8, 1])
            .strides(uniform(&[2; 5])),
        kernel_size: 3,
        act: Activation::Relu,
        norm: Norm::Batch,
        dropout: 0.0,
        bias: true,
    })
}

fn tl_predictor(image_size: usize) -> Result<TlPredictorConfig, MlError> {
    require_size(Architecture::TlPredictor, image_size)?;
    Ok(TlPredictorConfig {
        input_image_size: [image_size, image_size],
        latent_dim: 64,
        encoder: StageBlock::new(vec![1, 16, 32, 64, 128], vec![16, 32, 64, 128, 256])
            .strides(uniform(&[2; 5])),
        kernel_size: 3,
        act: Activation::Relu,
        norm: Norm::Batch,
        dropout: 0.0,
        bias: true,
    })
}

/// Look up and validate the configuration for `arch` at `image_size`.
pub fn model_config(
    arch: Architecture,
    image_size: usize,
    dropout: bool,
) -> Result<ModelConfig, MlError> {
    let config = match arch {
        Architecture::Unet => ModelConfig::Unet(unet(dropout)),
        Architecture::AttentionUnet => ModelConfig::AttentionUnet(attention_unet()),
        Architecture::MultiScale2DPermuteConcat => {
            ModelConfig::MultiScale2DPermuteConcat(multiscale_2d_permute_concat())
        }
        Architecture::TwoDPermuteConcatModel => {
            ModelConfig::TwoDPermuteConcat(two_d_permute_concat(image_size)?)
        }
        Architecture::OneDConcatModel => ModelConfig::OneDConcat(one_d_concat(image_size)?),
        Architecture::CustomAutoEncoder => {
            ModelConfig::AutoEncoder(custom_autoencoder(image_size)?)
        }
        Architecture::TlPredictor => ModelConfig::TlPredictor(tl_predictor(image_size)?),
    };
    config.validate()?;
    Ok(config)
}
