//! Preprocessing selection and data loader settings for the trainer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a sample is fed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputLayout {
    /// AP and LAT images as two separate 2D inputs.
    SeparateViews,
    /// Both views back-projected into a 2-channel volume.
    BackprojectedVolume,
    /// The segmentation volume itself (autoencoding).
    SegmentationVolume,
}

/// Preprocessing the trainer applies to every sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSpec {
    pub layout: InputLayout,
    pub image_size: usize,
    /// Voxel spacing in mm.
    pub resolution: f64,
}

impl TransformSpec {
    pub fn new(layout: InputLayout, image_size: usize, resolution: f64) -> Self {
        Self {
            layout,
            image_size,
            resolution,
        }
    }
}

/// Data loader settings for one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderSpec {
    pub manifest: PathBuf,
    pub batch_size: usize,
    pub num_workers: usize,
    pub shuffle: bool,
    pub drop_last: bool,
}

impl LoaderSpec {
    /// Shuffled, incomplete final batch dropped.
    pub fn training(manifest: PathBuf, batch_size: usize, num_workers: usize) -> Self {
        Self {
            manifest,
            batch_size,
            num_workers,
            shuffle: true,
            drop_last: true,
        }
    }

    /// In order, every sample kept.
    pub fn evaluation(manifest: PathBuf, batch_size: usize, num_workers: usize) -> Self {
        Self {
            manifest,
            batch_size,
            num_workers,
            shuffle: false,
            drop_last: false,
        }
    }
}
