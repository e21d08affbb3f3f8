//! Closed set of network architectures the harness knows how to configure.

use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network architecture family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    OneDConcatModel,
    AttentionUnet,
    TwoDPermuteConcatModel,
    Unet,
    MultiScale2DPermuteConcat,
    CustomAutoEncoder,
    #[serde(rename = "TLPredictor")]
    TlPredictor,
}

impl Architecture {
    pub const ALL: [Architecture; 7] = [
        Architecture::OneDConcatModel,
        Architecture::AttentionUnet,
        Architecture::TwoDPermuteConcatModel,
        Architecture::Unet,
        Architecture::MultiScale2DPermuteConcat,
        Architecture::CustomAutoEncoder,
        Architecture::TlPredictor,
    ];

    /// Canonical model name, as stored in run configs under `MODEL_NAME`.
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::OneDConcatModel => "OneDConcatModel",
            Architecture::AttentionUnet => "AttentionUnet",
            Architecture::TwoDPermuteConcatModel => "TwoDPermuteConcatModel",
            Architecture::Unet => "Unet",
            Architecture::MultiScale2DPermuteConcat => "MultiScale2DPermuteConcat",
            Architecture::CustomAutoEncoder => "CustomAutoEncoder",
            Architecture::TlPredictor => "TLPredictor",
        }
    }

    /// Whether the configuration depends on the input image size.
    pub fn is_size_dependent(&self) -> bool {
        matches!(
            self,
            Architecture::OneDConcatModel
                | Architecture::TwoDPermuteConcatModel
                | Architecture::CustomAutoEncoder
                | Architecture::TlPredictor
        )
    }

    /// Whether dropout can be toggled for this architecture.
    pub fn supports_dropout(&self) -> bool {
        matches!(self, Architecture::Unet)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .iter()
            .find(|a| a.name() == s)
            .copied()
            .ok_or_else(|| {
                let valid: Vec<&str> = Architecture::ALL.iter().map(|a| a.name()).collect();
                MlError::invalid_input(format!(
                    "unknown model '{s}', expected one of: {}",
                    valid.join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for arch in Architecture::ALL {
            assert_eq!(arch.name().parse::<Architecture>().unwrap(), arch);
        }
    }

    #[test]
    fn test_unknown_lists_valid_names() {
        let err = "UNETR".parse::<Architecture>().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("UNETR"));
        assert!(msg.contains("TLPredictor"));
        assert!(msg.contains("OneDConcatModel"));
    }

    #[test]
    fn test_serde_uses_model_names() {
        let json = serde_json::to_string(&Architecture::TlPredictor).unwrap();
        assert_eq!(json, "\"TLPredictor\"");
        let json = serde_json::to_string(&Architecture::Unet).unwrap();
        assert_eq!(json, "\"Unet\"");
    }
}
