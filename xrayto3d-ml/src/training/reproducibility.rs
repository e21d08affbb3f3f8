//! Environment snapshots stored with each run record.

use crate::runtime::PythonInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const TRACKED_ENV_VARS: [&str; 3] = ["PATH", "PYTHONPATH", "CUDA_VISIBLE_DEVICES"];

/// Snapshot of the training environment for reproducibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub python_version: Option<String>,
    pub venv_path: Option<std::path::PathBuf>,
    pub system_info: String,
    pub platform: String,
    pub cuda_visible_devices: Option<String>,
    pub seed: u64,
    pub timestamp: DateTime<Utc>,
    /// Hash of PATH, PYTHONPATH and CUDA_VISIBLE_DEVICES.
    pub env_vars_hash: String,
}

impl EnvironmentSnapshot {
    pub fn capture(seed: u64) -> Self {
        Self {
            python_version: None,
            venv_path: None,
            system_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            platform: std::env::consts::OS.to_string(),
            cuda_visible_devices: std::env::var("CUDA_VISIBLE_DEVICES").ok(),
            seed,
            timestamp: Utc::now(),
            env_vars_hash: Self::compute_env_vars_hash(),
        }
    }

    pub fn with_python(mut self, info: Option<PythonInfo>) -> Self {
        if let Some(info) = info {
            self.python_version = Some(info.version);
            self.venv_path = info.venv_path;
        }
        self
    }

    fn compute_env_vars_hash() -> String {
        let mut hasher = Sha256::new();
        for var in TRACKED_ENV_VARS {
            let value = std::env::var(var).unwrap_or_default();
            hasher.update(var.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture() {
        let snap = EnvironmentSnapshot::capture(12345);
        assert_eq!(snap.seed, 12345);
        assert_eq!(snap.env_vars_hash.len(), 64);
        assert_eq!(snap.platform, std::env::consts::OS);
    }

    #[test]
    fn test_hash_is_stable_within_process() {
        let a = EnvironmentSnapshot::capture(1);
        let b = EnvironmentSnapshot::capture(2);
        assert_eq!(a.env_vars_hash, b.env_vars_hash);
    }

    #[test]
    fn test_with_python() {
        let snap = EnvironmentSnapshot::capture(0).with_python(Some(PythonInfo {
            path: "python3".into(),
            version: "Python 3.10.12".into(),
            venv_path: None,
        }));
        assert_eq!(snap.python_version.as_deref(), Some("Python 3.10.12"));
    }
}
