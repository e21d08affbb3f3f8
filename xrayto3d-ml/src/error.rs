//! Error types for the xrayto3d-ml crate.

use thiserror::Error;

/// Top-level error type for harness operations.
#[derive(Debug, Error)]
pub enum MlError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Lookup failed: {0}")]
    Lookup(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Python runtime error: {0}")]
    Python(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl MlError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn tracking(msg: impl Into<String>) -> Self {
        Self::Tracking(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}
