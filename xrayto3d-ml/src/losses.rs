//! Loss selection with anatomy-specific class weighting.

use crate::anatomy::Anatomy;
use crate::error::MlError;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported loss functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    #[serde(rename = "BCEWithLogitsLoss")]
    BceWithLogits,
    #[serde(rename = "CrossEntropyLoss")]
    CrossEntropy,
    #[serde(rename = "DiceLoss")]
    Dice,
    #[serde(rename = "DiceCELoss")]
    DiceCe,
}

impl LossKind {
    pub const ALL: [LossKind; 4] = [
        LossKind::BceWithLogits,
        LossKind::CrossEntropy,
        LossKind::Dice,
        LossKind::DiceCe,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LossKind::BceWithLogits => "BCEWithLogitsLoss",
            LossKind::CrossEntropy => "CrossEntropyLoss",
            LossKind::Dice => "DiceLoss",
            LossKind::DiceCe => "DiceCELoss",
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LossKind {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LossKind::ALL
            .iter()
            .find(|k| k.name() == s)
            .copied()
            .ok_or_else(|| {
                let valid: Vec<&str> = LossKind::ALL.iter().map(|k| k.name()).collect();
                MlError::invalid_input(format!(
                    "unknown loss '{s}', expected one of: {}",
                    valid.join(", ")
                ))
            })
    }
}

/// Inputs a loss needs beyond its name.
#[derive(Debug, Clone, PartialEq)]
pub struct LossContext {
    pub anatomy: Anatomy,
    pub image_size: usize,
    pub lambda_dice: f64,
    pub lambda_bce: f64,
}

impl LossContext {
    pub fn new(anatomy: Anatomy, image_size: usize) -> Self {
        Self {
            anatomy,
            image_size,
            lambda_dice: 1.0,
            lambda_bce: 1.0,
        }
    }

    pub fn with_lambdas(mut self, lambda_dice: f64, lambda_bce: f64) -> Self {
        self.lambda_dice = lambda_dice;
        self.lambda_bce = lambda_bce;
        self
    }
}

/// A constructed loss and the buffers it carries.
#[derive(Debug, Clone, PartialEq)]
pub enum LossFunction {
    WeightedBce {
        pos_weight: Array4<f32>,
    },
    WeightedCrossEntropy {
        weight: Array4<f32>,
    },
    Dice {
        sigmoid: bool,
    },
    DiceCe {
        sigmoid: bool,
        ce_pos_weight: Array4<f32>,
        lambda_dice: f64,
        lambda_bce: f64,
    },
}

/// Serializable description of a loss, handed to the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossSpec {
    pub name: LossKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_weight: Option<ClassWeightSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigmoid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda_dice: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda_bce: Option<f64>,
}

/// Constant-filled weight tensor, described by its buffer name, shape and value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWeightSpec {
    pub buffer: String,
    pub shape: [usize; 4],
    pub value: f32,
}

impl LossFunction {
    pub fn kind(&self) -> LossKind {
        match self {
            LossFunction::WeightedBce { .. } => LossKind::BceWithLogits,
            LossFunction::WeightedCrossEntropy { .. } => LossKind::CrossEntropy,
            LossFunction::Dice { .. } => LossKind::Dice,
            LossFunction::DiceCe { .. } => LossKind::DiceCe,
        }
    }

    /// The class-weight buffer, if this loss carries one.
    pub fn class_weight(&self) -> Option<&Array4<f32>> {
        match self {
            LossFunction::WeightedBce { pos_weight } => Some(pos_weight),
            LossFunction::WeightedCrossEntropy { weight } => Some(weight),
            LossFunction::DiceCe { ce_pos_weight, .. } => Some(ce_pos_weight),
            LossFunction::Dice { .. } => None,
        }
    }

    /// Name under which the class weight is registered as a module buffer.
    pub fn buffer_name(&self) -> Option<&'static str> {
        match self {
            LossFunction::WeightedBce { .. } => Some("pos_weight"),
            LossFunction::WeightedCrossEntropy { .. } => Some("weight"),
            LossFunction::DiceCe { .. } => Some("bce.pos_weight"),
            LossFunction::Dice { .. } => None,
        }
    }

    pub fn spec(&self) -> LossSpec {
        let class_weight = self.class_weight().zip(self.buffer_name()).map(|(w, buffer)| {
            let (a, b, c, d) = w.dim();
            ClassWeightSpec {
                buffer: buffer.to_string(),
                shape: [a, b, c, d],
                value: w.first().copied().unwrap_or_default(),
            }
        });
        let (sigmoid, lambda_dice, lambda_bce) = match self {
            LossFunction::Dice { sigmoid } => (Some(*sigmoid), None, None),
            LossFunction::DiceCe {
                sigmoid,
                lambda_dice,
                lambda_bce,
                ..
            } => (Some(*sigmoid), Some(*lambda_dice), Some(*lambda_bce)),
            _ => (None, None, None),
        };
        LossSpec {
            name: self.kind(),
            class_weight,
            sigmoid,
            lambda_dice,
            lambda_bce,
        }
    }
}

/// `[1, s, s, s]` tensor filled with the anatomy's positive-class weight.
pub fn positive_class_weight(anatomy: Anatomy, image_size: usize) -> Array4<f32> {
    Array4::from_elem((1, image_size, image_size, image_size), anatomy.pos_weight())
}

/// Construct the loss named `name` for the given context.
pub fn build_loss(name: &str, ctx: &LossContext) -> Result<LossFunction, MlError> {
    let kind: LossKind = name.parse()?;
    if ctx.image_size == 0 {
        return Err(MlError::invalid_input("loss image size must be positive"));
    }
    let loss = match kind {
        LossKind::BceWithLogits => LossFunction::WeightedBce {
            pos_weight: positive_class_weight(ctx.anatomy, ctx.image_size),
        },
        LossKind::CrossEntropy => LossFunction::WeightedCrossEntropy {
            weight: positive_class_weight(ctx.anatomy, ctx.image_size),
        },
        LossKind::Dice => LossFunction::Dice { sigmoid: true },
        LossKind::DiceCe => LossFunction::DiceCe {
            sigmoid: true,
            ce_pos_weight: positive_class_weight(ctx.anatomy, ctx.image_size),
            lambda_dice: ctx.lambda_dice,
            lambda_bce: ctx.lambda_bce,
        },
    };
    tracing::debug!(loss = %kind, anatomy = %ctx.anatomy, "Built loss");
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bce_weight_tensor_shape_and_value() {
        let ctx = LossContext::new(Anatomy::Femur, 16);
        let loss = build_loss("BCEWithLogitsLoss", &ctx).unwrap();
        let weight = loss.class_weight().unwrap();
        assert_eq!(weight.dim(), (1, 16, 16, 16));
        assert!(weight.iter().all(|&w| w == 612.0));
        assert_eq!(loss.buffer_name(), Some("pos_weight"));
    }

    #[test]
    fn test_femur_weight_at_training_size() {
        let weight = positive_class_weight(Anatomy::Femur, 64);
        assert_eq!(weight.shape(), &[1, 64, 64, 64]);
        assert_eq!(weight.len(), 64 * 64 * 64);
        assert!(weight.iter().all(|&w| w == 612.0));
    }

    #[test]
    fn test_dice_has_no_weight() {
        let ctx = LossContext::new(Anatomy::Rib, 8);
        let loss = build_loss("DiceLoss", &ctx).unwrap();
        assert!(loss.class_weight().is_none());
        assert_eq!(loss, LossFunction::Dice { sigmoid: true });
    }

    #[test]
    fn test_dice_ce_carries_lambdas() {
        let ctx = LossContext::new(Anatomy::Vertebra, 4).with_lambdas(0.5, 2.0);
        let spec = build_loss("DiceCELoss", &ctx).unwrap().spec();
        assert_eq!(spec.name, LossKind::DiceCe);
        assert_eq!(spec.lambda_dice, Some(0.5));
        assert_eq!(spec.lambda_bce, Some(2.0));
        let weight = spec.class_weight.unwrap();
        assert_eq!(weight.value, 23.0);
        assert_eq!(weight.shape, [1, 4, 4, 4]);
    }

    #[test]
    fn test_qualified_anatomy_uses_base_weight() {
        let ctx = LossContext::new(Anatomy::TotalsegRibs, 2);
        let loss = build_loss("CrossEntropyLoss", &ctx).unwrap();
        assert!(loss.class_weight().unwrap().iter().all(|&w| w == 5231.0));
    }

    #[test]
    fn test_unknown_loss_is_invalid_input() {
        let ctx = LossContext::new(Anatomy::Hip, 8);
        let err = build_loss("FocalLoss", &ctx).unwrap_err();
        assert!(matches!(err, MlError::InvalidInput(_)));
        assert!(err.to_string().contains("DiceCELoss"));
    }

    #[test]
    fn test_spec_serializes_loss_name() {
        let ctx = LossContext::new(Anatomy::Hip, 2);
        let spec = build_loss("BCEWithLogitsLoss", &ctx).unwrap().spec();
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["name"], "BCEWithLogitsLoss");
        assert_eq!(json["class_weight"]["value"], 719.0);
        assert!(json.get("lambda_dice").is_none());
    }
}
