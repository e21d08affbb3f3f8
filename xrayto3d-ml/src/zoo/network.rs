//! Network descriptors: architecture, configuration, parameter layout and weights.
//!
//! The layer math lives in the external trainer. On this side a network is the set
//! of named parameters its configuration implies, which is enough to validate and
//! remap checkpoints before handing them over. The derived names are a stand-in:
//! before a strict load the trainer's own names are adopted from a `describe` job
//! (see [`ModelLayout`]).

use crate::checkpoint::path::ParamPath;
use crate::checkpoint::state_dict::{Checkpoint, StateDict, TensorRecord};
use crate::error::MlError;
use crate::zoo::architecture::Architecture;
use crate::zoo::config::{KernelSize, ModelConfig, StageBlock, embedding_size};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Outcome of loading a state dict into a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Parameter names and shapes of a network as the trainer builds it.
///
/// Keys are the network's own state-dict names, without the `model.` prefix the
/// trainer module adds when it saves a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLayout {
    pub architecture: Architecture,
    pub parameters: BTreeMap<String, Vec<usize>>,
}

impl ModelLayout {
    /// The layout a network derives from its own configuration.
    pub fn of(network: &Network) -> Self {
        Self {
            architecture: network.architecture(),
            parameters: network
                .layout
                .iter()
                .map(|(path, shape)| (path.to_string(), shape.clone()))
                .collect(),
        }
    }
}

/// A configured network and the weights loaded into it so far.
#[derive(Debug, Clone)]
pub struct Network {
    image_size: usize,
    config: ModelConfig,
    layout: BTreeMap<ParamPath, Vec<usize>>,
    weights: StateDict,
}

impl Network {
    pub fn new(config: ModelConfig, image_size: usize) -> Result<Self, MlError> {
        config.validate()?;
        let layout = parameter_layout(&config, image_size)?;
        Ok(Self {
            image_size,
            config,
            layout,
            weights: StateDict::new(),
        })
    }

    pub fn architecture(&self) -> Architecture {
        self.config.architecture()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn layout(&self) -> &BTreeMap<ParamPath, Vec<usize>> {
        &self.layout
    }

    pub fn weights(&self) -> &StateDict {
        &self.weights
    }

    /// Replace the derived parameter layout with the one the trainer reported.
    ///
    /// Loaded weights are discarded. Fails when the report is for a different
    /// architecture, is empty, or names an unparseable path.
    pub fn adopt_layout(&mut self, reported: ModelLayout) -> Result<(), MlError> {
        if reported.architecture != self.architecture() {
            return Err(MlError::load(format!(
                "trainer described {}, expected {}",
                reported.architecture,
                self.architecture()
            )));
        }
        if reported.parameters.is_empty() {
            return Err(MlError::load(format!(
                "trainer described {} with no parameters",
                self.architecture()
            )));
        }
        let layout = reported
            .parameters
            .into_iter()
            .map(|(name, shape)| Ok((name.parse::<ParamPath>()?, shape)))
            .collect::<Result<BTreeMap<_, _>, MlError>>()?;
        let renamed = layout.keys().filter(|k| !self.layout.contains_key(*k)).count();
        debug!(
            architecture = %self.architecture(),
            parameters = layout.len(),
            renamed,
            "Adopted trainer parameter layout"
        );
        self.layout = layout;
        self.weights = StateDict::new();
        Ok(())
    }

    /// Total number of scalar parameters, running statistics included.
    pub fn parameter_count(&self) -> usize {
        self.layout.values().map(|s| s.iter().product::<usize>()).sum()
    }

    /// Copy matching tensors from `state` into this network.
    ///
    /// Shape mismatches always fail. With `strict`, any missing or unexpected key
    /// fails too; otherwise they are reported. Nothing is written on failure.
    pub fn load_state_dict(&mut self, state: StateDict, strict: bool) -> Result<LoadReport, MlError> {
        let mut mismatched = Vec::new();
        let mut unexpected = Vec::new();
        for (path, tensor) in state.iter() {
            match self.layout.get(path) {
                Some(shape) if *shape != tensor.shape => mismatched.push(format!(
                    "{path}: checkpoint {:?}, model {:?}",
                    tensor.shape, shape
                )),
                Some(_) => {}
                None => unexpected.push(path.to_string()),
            }
        }
        let missing: Vec<String> = self
            .layout
            .keys()
            .filter(|path| !state.contains(path))
            .map(ToString::to_string)
            .collect();

        if !mismatched.is_empty() {
            return Err(MlError::load(format!(
                "size mismatch loading {}: {}",
                self.architecture(),
                mismatched.join("; ")
            )));
        }
        if strict && (!missing.is_empty() || !unexpected.is_empty()) {
            return Err(MlError::load(format!(
                "error loading state dict for {}: missing keys [{}], unexpected keys [{}]",
                self.architecture(),
                missing.join(", "),
                unexpected.join(", ")
            )));
        }

        let mut loaded = 0;
        for (path, tensor) in state {
            if self.layout.contains_key(&path) {
                self.weights.insert(path, tensor);
                loaded += 1;
            }
        }

        Ok(LoadReport {
            loaded,
            missing,
            unexpected,
        })
    }

    /// Package the loaded weights as a checkpoint tagged with the architecture.
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.weights.clone())
            .with_metadata("architecture", self.architecture().name())
            .with_metadata("image_size", self.image_size.to_string())
    }

    /// Zero-initialised state dict covering the whole layout.
    pub fn zeroed_state_dict(&self) -> StateDict {
        self.layout
            .iter()
            .map(|(path, shape)| (path.clone(), TensorRecord::zeros(shape)))
            .collect()
    }
}

struct LayoutBuilder {
    params: BTreeMap<ParamPath, Vec<usize>>,
}

impl LayoutBuilder {
    fn new() -> Self {
        Self {
            params: BTreeMap::new(),
        }
    }

    fn root(name: &str) -> Result<ParamPath, MlError> {
        name.parse()
    }

    fn conv(&mut self, at: &ParamPath, cin: usize, cout: usize, kernel: usize, dims: u32, bias: bool) {
        let mut shape = vec![cout, cin];
        shape.extend(std::iter::repeat_n(kernel, dims as usize));
        self.params.insert(at.child("weight"), shape);
        if bias {
            self.params.insert(at.child("bias"), vec![cout]);
        }
    }

    fn batch_norm(&mut self, at: &ParamPath, features: usize) {
        for name in ["weight", "bias", "running_mean", "running_var"] {
            self.params.insert(at.child(name), vec![features]);
        }
    }

    fn linear(&mut self, at: &ParamPath, fin: usize, fout: usize, bias: bool) {
        self.params.insert(at.child("weight"), vec![fout, fin]);
        if bias {
            self.params.insert(at.child("bias"), vec![fout]);
        }
    }

    /// Conv + norm per stage; the last stage of an output stack has no norm.
    fn stages(
        &mut self,
        at: &ParamPath,
        block: &StageBlock,
        default_kernel: usize,
        dims: u32,
        bias: bool,
        output_stack: bool,
    ) {
        let kernel = block
            .kernel_size
            .clone()
            .unwrap_or(KernelSize::Uniform(default_kernel));
        let depth = block.depth();
        for (i, (&cin, &cout)) in block.in_channels.iter().zip(&block.out_channels).enumerate() {
            let stage = at.child(i);
            let k = kernel.at(i).unwrap_or(default_kernel);
            self.conv(&stage.child("conv"), cin, cout, k, dims, bias);
            if !(output_stack && i + 1 == depth) {
                self.batch_norm(&stage.child("norm"), cout);
            }
        }
    }

    fn unet_levels(
        &mut self,
        in_channels: usize,
        out_channels: usize,
        channels: &[usize],
        res_units: usize,
        attention: bool,
    ) -> Result<(), MlError> {
        let down = Self::root("down")?;
        for (i, &cout) in channels.iter().enumerate() {
            let cin = if i == 0 { in_channels } else { channels[i - 1] };
            for unit in 0..res_units {
                let at = down.child(i).child(format!("unit{unit}"));
                let unit_in = if unit == 0 { cin } else { cout };
                self.conv(&at.child("conv"), unit_in, cout, 3, 3, true);
                self.batch_norm(&at.child("norm"), cout);
            }
            if res_units > 1 {
                self.conv(&down.child(i).child("residual"), cin, cout, 3, 3, true);
            }
        }

        let up = Self::root("up")?;
        let levels = channels.len();
        for i in (0..levels - 1).rev() {
            let incoming = if i == levels - 2 {
                channels[levels - 1]
            } else {
                channels[i]
            };
            let skip = channels[i];
            let cout = if i == 0 { out_channels } else { channels[i - 1] };
            let at = up.child(i);
            if attention {
                let gate = at.child("attention");
                self.conv(&gate.child("w_g"), incoming, skip, 1, 3, true);
                self.conv(&gate.child("w_x"), skip, skip, 1, 3, true);
                self.conv(&gate.child("psi"), skip, 1, 1, 3, true);
            }
            self.conv(&at.child("conv"), skip + incoming, cout, 3, 3, true);
            if i != 0 {
                self.batch_norm(&at.child("norm"), cout);
            }
        }
        Ok(())
    }

    fn finish(self) -> BTreeMap<ParamPath, Vec<usize>> {
        self.params
    }
}

fn last_channel(block: &StageBlock) -> usize {
    block.out_channels.last().copied().unwrap_or_default()
}

fn parameter_layout(
    config: &ModelConfig,
    image_size: usize,
) -> Result<BTreeMap<ParamPath, Vec<usize>>, MlError> {
    let mut b = LayoutBuilder::new();
    match config {
        ModelConfig::Unet(c) => {
            b.unet_levels(c.in_channels, c.out_channels, &c.channels, c.num_res_units, false)?;
        }
        ModelConfig::AttentionUnet(c) => {
            b.unet_levels(c.in_channels, c.out_channels, &c.channels, 1, true)?;
        }
        ModelConfig::MultiScale2DPermuteConcat(c) => {
            for view in ["ap_encoder", "lat_encoder"] {
                let root = LayoutBuilder::root(view)?;
                let stem_out = c.encoder.in_channels.first().copied().unwrap_or(1);
                b.conv(&root.child("stem"), 1, stem_out, 3, 2, true);
                for scale in 0..c.encoder.encoder_count {
                    let block = StageBlock {
                        in_channels: c.encoder.in_channels.clone(),
                        out_channels: c.encoder.out_channels.clone(),
                        strides: Vec::new(),
                        kernel_size: Some(KernelSize::Uniform(c.encoder.kernel_size)),
                    };
                    b.stages(&root.child(scale), &block, c.encoder.kernel_size, 2, true, false);
                }
            }
            let decoder = StageBlock {
                in_channels: c.decoder_2d.in_channels.clone(),
                out_channels: c.decoder_2d.out_channels.clone(),
                strides: Vec::new(),
                kernel_size: Some(KernelSize::Uniform(c.decoder_2d.kernel_size)),
            };
            for view in ["ap_decoder", "lat_decoder"] {
                let root = LayoutBuilder::root(view)?;
                b.stages(&root, &decoder, c.decoder_2d.kernel_size, 2, true, false);
            }
            let fusion = StageBlock {
                in_channels: c.fusion_3d.in_channels.clone(),
                out_channels: c.fusion_3d.out_channels.clone(),
                strides: Vec::new(),
                kernel_size: Some(KernelSize::Uniform(c.fusion_3d.kernel_size)),
            };
            let root = LayoutBuilder::root("fusion")?;
            b.stages(&root, &fusion, c.fusion_3d.kernel_size, 3, true, false);
            let head = LayoutBuilder::root("head")?;
            b.conv(&head, last_channel(&fusion), 1, 1, 3, true);
        }
        ModelConfig::TwoDPermuteConcat(c) => {
            for view in ["ap_encoder", "lat_encoder"] {
                b.stages(&LayoutBuilder::root(view)?, &c.encoder, 7, 2, c.bias, false);
            }
            b.stages(&LayoutBuilder::root("ap_expansion")?, &c.ap_expansion, 3, 3, c.bias, false);
            b.stages(&LayoutBuilder::root("lat_expansion")?, &c.lat_expansion, 3, 3, c.bias, false);
            b.stages(&LayoutBuilder::root("decoder")?, &c.decoder, 3, 3, c.bias, true);
        }
        ModelConfig::OneDConcat(c) => {
            for view in ["ap_encoder", "lat_encoder"] {
                b.stages(&LayoutBuilder::root(view)?, &c.encoder, c.kernel_size, 2, c.bias, false);
            }
            b.stages(&LayoutBuilder::root("decoder")?, &c.decoder, c.kernel_size, 3, c.bias, true);
        }
        ModelConfig::AutoEncoder(c) => {
            let flat = embedding_size(image_size, &c.encoder.strides, last_channel(&c.encoder), 3)?;
            b.stages(&LayoutBuilder::root("encoder")?, &c.encoder, c.kernel_size, 3, c.bias, false);
            b.linear(&LayoutBuilder::root("latent")?, flat, c.latent_dim, true);
            b.linear(&LayoutBuilder::root("expand")?, c.latent_dim, flat, true);
            b.stages(&LayoutBuilder::root("decoder")?, &c.decoder, c.kernel_size, 3, c.bias, true);
        }
        ModelConfig::TlPredictor(c) => {
            let flat = embedding_size(image_size, &c.encoder.strides, last_channel(&c.encoder), 2)?;
            for view in ["ap_encoder", "lat_encoder"] {
                b.stages(&LayoutBuilder::root(view)?, &c.encoder, c.kernel_size, 2, c.bias, false);
            }
            b.linear(&LayoutBuilder::root("latent")?, 2 * flat, c.latent_dim, true);
        }
    }
    Ok(b.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zoo::config::model_config;

    fn network(arch: Architecture, size: usize) -> Network {
        Network::new(model_config(arch, size, false).unwrap(), size).unwrap()
    }

    fn path(s: &str) -> ParamPath {
        s.parse().unwrap()
    }

    #[test]
    fn test_layout_shapes() {
        let ae = network(Architecture::CustomAutoEncoder, 64);
        // 64 / 2^5 = 2 -> 2^3 * 128 = 1024
        assert_eq!(ae.layout()[&path("latent.weight")], vec![64, 1024]);
        assert_eq!(ae.layout()[&path("encoder.0.conv.weight")], vec![8, 1, 3, 3, 3]);
        assert!(ae.layout().contains_key(&path("encoder.0.norm.running_var")));
        assert!(!ae.layout().contains_key(&path("decoder.4.norm.weight")));

        let two_d = network(Architecture::TwoDPermuteConcatModel, 64);
        assert_eq!(
            two_d.layout()[&path("ap_encoder.0.conv.weight")],
            vec![16, 1, 7, 7]
        );
        assert!(!two_d.layout().contains_key(&path("ap_encoder.0.conv.bias")));
        assert_eq!(
            two_d.layout()[&path("decoder.6.conv.weight")],
            vec![1, 16, 7, 7, 7]
        );
    }

    #[test]
    fn test_parameter_count_positive_for_every_architecture() {
        for arch in Architecture::ALL {
            let net = network(arch, 64);
            assert!(net.parameter_count() > 0, "{arch}");
        }
    }

    #[test]
    fn test_strict_load_accepts_exact_state() {
        let mut ae = network(Architecture::CustomAutoEncoder, 64);
        let state = ae.zeroed_state_dict();
        let report = ae.load_state_dict(state, true).unwrap();
        assert!(report.is_exact());
        assert_eq!(report.loaded, ae.layout().len());
        assert_eq!(ae.weights().len(), ae.layout().len());
    }

    #[test]
    fn test_strict_load_rejects_unexpected_key() {
        let mut ae = network(Architecture::CustomAutoEncoder, 64);
        let mut state = ae.zeroed_state_dict();
        state.insert(path("loss_function.pos_weight"), TensorRecord::zeros(&[1, 2, 2, 2]));
        let err = ae.load_state_dict(state, true).unwrap_err();
        assert!(matches!(err, MlError::Load(_)));
        assert!(err.to_string().contains("loss_function.pos_weight"));
        assert!(ae.weights().is_empty());
    }

    #[test]
    fn test_non_strict_reports_missing_and_unexpected() {
        let mut tl = network(Architecture::TlPredictor, 64);
        let mut state = StateDict::new();
        state.insert(
            path("latent.bias"),
            TensorRecord::zeros(&tl.layout()[&path("latent.bias")]),
        );
        state.insert(path("decoder.0.conv.weight"), TensorRecord::zeros(&[1]));
        let report = tl.load_state_dict(state, false).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.unexpected, vec!["decoder.0.conv.weight".to_string()]);
        assert_eq!(report.missing.len(), tl.layout().len() - 1);
    }

    /// Names as a MONAI-built autoencoder reports them.
    fn reported_autoencoder() -> ModelLayout {
        let parameters = [
            ("encode.encode_0.conv.unit0.conv.weight", vec![8, 1, 3, 3, 3]),
            ("encode.encode_0.conv.unit0.conv.bias", vec![8]),
            ("encode.encode_0.conv.unit0.adn.N.weight", vec![8]),
            ("intermediate.weight", vec![64, 1024]),
        ];
        ModelLayout {
            architecture: Architecture::CustomAutoEncoder,
            parameters: parameters
                .into_iter()
                .map(|(name, shape)| (name.to_string(), shape))
                .collect(),
        }
    }

    #[test]
    fn test_strict_load_follows_adopted_layout() {
        let mut ae = network(Architecture::CustomAutoEncoder, 64);
        let derived = ae.zeroed_state_dict();
        ae.adopt_layout(reported_autoencoder()).unwrap();
        assert_eq!(ae.layout().len(), 4);
        assert!(ae.layout().contains_key(&path("intermediate.weight")));

        let err = ae.load_state_dict(derived, true).unwrap_err();
        assert!(err.to_string().contains("encode.encode_0.conv.unit0.conv.weight"));

        let state = ae.zeroed_state_dict();
        let report = ae.load_state_dict(state, true).unwrap();
        assert_eq!(report.loaded, 4);
        assert_eq!(ModelLayout::of(&ae), reported_autoencoder());
    }

    #[test]
    fn test_adopt_layout_rejects_other_architecture() {
        let mut tl = network(Architecture::TlPredictor, 64);
        let before = tl.layout().clone();
        let err = tl.adopt_layout(reported_autoencoder()).unwrap_err();
        assert!(matches!(err, MlError::Load(_)));
        assert_eq!(tl.layout(), &before);

        let empty = ModelLayout {
            architecture: Architecture::TlPredictor,
            parameters: BTreeMap::new(),
        };
        assert!(tl.adopt_layout(empty).is_err());
    }

    #[test]
    fn test_model_layout_json_shape() {
        let layout: ModelLayout = serde_json::from_str(
            r#"{"architecture": "CustomAutoEncoder", "parameters": {"intermediate.weight": [64, 1024]}}"#,
        )
        .unwrap();
        assert_eq!(layout.parameters["intermediate.weight"], vec![64, 1024]);
    }

    #[test]
    fn test_shape_mismatch_always_fails() {
        let mut tl = network(Architecture::TlPredictor, 64);
        let mut state = StateDict::new();
        state.insert(path("latent.bias"), TensorRecord::zeros(&[3]));
        assert!(tl.load_state_dict(state, false).is_err());
    }
}
