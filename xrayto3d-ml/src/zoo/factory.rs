//! Architecture name → configured network.

use crate::error::MlError;
use crate::zoo::architecture::Architecture;
use crate::zoo::config::model_config;
use crate::zoo::network::Network;
use tracing::debug;

/// Build the network for `arch` at `image_size`.
pub fn build_model(arch: Architecture, image_size: usize, dropout: bool) -> Result<Network, MlError> {
    let config = model_config(arch, image_size, dropout)?;
    let network = Network::new(config, image_size)?;
    debug!(
        model = %arch,
        image_size,
        parameters = network.parameter_count(),
        "Built model"
    );
    Ok(network)
}

/// Parse a model name and build it; unknown names fail before anything is built.
pub fn build_model_by_name(name: &str, image_size: usize, dropout: bool) -> Result<Network, MlError> {
    let arch: Architecture = name.parse()?;
    build_model(arch, image_size, dropout)
}
