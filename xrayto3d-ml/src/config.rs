//! Configuration for the harness.
//!
//! Uses `figment` for layered configuration: defaults -> user config -> workspace
//! config -> environment -> explicit overrides. Files live at
//! `~/.config/xrayto3d/config.toml` and `.xrayto3d/config.toml` in the workspace.

use crate::error::MlError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level harness configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XrayConfig {
    /// Where runs, checkpoints and report metadata live.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Experiment tracking backend.
    #[serde(default)]
    pub tracking: TrackingConfig,
    /// External trainer process.
    #[serde(default)]
    pub trainer: TrainerConfig,
    /// Training defaults.
    #[serde(default)]
    pub training: TrainingDefaults,
    /// Evaluation defaults.
    #[serde(default)]
    pub evaluation: EvaluationDefaults,
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for run directories (`{runs_dir}/{project}/{run_id}`).
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    /// Directory for benchmark JSON summaries.
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
    /// File name of the per-case metric log written during evaluation.
    #[serde(default = "default_metric_log_name")]
    pub metric_log_name: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            metadata_dir: default_metadata_dir(),
            metric_log_name: default_metric_log_name(),
        }
    }
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("metadata")
}

fn default_metric_log_name() -> String {
    "metric-log.csv".to_string()
}

/// Which run store the reporter and training driver talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingBackend {
    #[default]
    Local,
    Wandb,
}

/// Experiment tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default)]
    pub backend: TrackingBackend,
    /// Project that groups benchmark runs.
    #[serde(default = "default_project")]
    pub project: String,
    /// Entity (user or team) owning the project on the hosted tracker.
    #[serde(default)]
    pub entity: Option<String>,
    /// Environment variable holding the hosted tracker API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Hosted tracker API root.
    #[serde(default = "default_tracking_url")]
    pub base_url: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            backend: TrackingBackend::Local,
            project: default_project(),
            entity: None,
            api_key_env: default_api_key_env(),
            base_url: default_tracking_url(),
        }
    }
}

fn default_project() -> String {
    "2d-3d-benchmark".to_string()
}

fn default_api_key_env() -> String {
    "WANDB_API_KEY".to_string()
}

fn default_tracking_url() -> String {
    "https://api.wandb.ai".to_string()
}

/// External trainer process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Path to Python executable.
    #[serde(default = "default_python_path")]
    pub python_path: PathBuf,
    /// Virtual environment to run the trainer from.
    #[serde(default)]
    pub venv_path: Option<PathBuf>,
    /// Trainer entrypoint script, invoked as `<entrypoint> <fit|predict|smoke|describe> --job <path>`.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: PathBuf,
    /// Maximum wall-clock time for one trainer invocation (seconds).
    #[serde(default = "default_trainer_timeout")]
    pub timeout_secs: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            python_path: default_python_path(),
            venv_path: None,
            entrypoint: default_entrypoint(),
            timeout_secs: default_trainer_timeout(),
        }
    }
}

fn default_python_path() -> PathBuf {
    PathBuf::from("python3")
}

fn default_entrypoint() -> PathBuf {
    PathBuf::from("trainer/entrypoint.py")
}

fn default_trainer_timeout() -> u64 {
    7 * 24 * 3600
}

/// Training defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingDefaults {
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainingDefaults {
    fn default() -> Self {
        Self {
            seed: default_seed(),
        }
    }
}

fn default_seed() -> u64 {
    12345
}

/// Evaluation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationDefaults {
    /// Surface-distance tolerance (mm) for NSD.
    #[serde(default = "default_nsd_tolerance")]
    pub nsd_tolerance: f64,
}

impl Default for EvaluationDefaults {
    fn default() -> Self {
        Self {
            nsd_tolerance: default_nsd_tolerance(),
        }
    }
}

fn default_nsd_tolerance() -> f64 {
    1.5
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "xrayto3d", "xrayto3d")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Workspace-level config file location.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".xrayto3d").join("config.toml")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (`XRAYTO3D_TRACKING__PROJECT`, ...)
/// 3. Workspace config (`.xrayto3d/config.toml`)
/// 4. User config
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&XrayConfig>,
) -> Result<XrayConfig, MlError> {
    let mut figment = Figment::from(Serialized::defaults(XrayConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment.merge(Env::prefixed("XRAYTO3D_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment
        .extract()
        .map_err(|e| MlError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = XrayConfig::default();
        assert_eq!(config.paths.runs_dir, PathBuf::from("runs"));
        assert_eq!(config.paths.metric_log_name, "metric-log.csv");
        assert_eq!(config.tracking.backend, TrackingBackend::Local);
        assert_eq!(config.tracking.project, "2d-3d-benchmark");
        assert_eq!(config.training.seed, 12345);
        assert_eq!(config.evaluation.nsd_tolerance, 1.5);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = XrayConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: XrayConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.tracking.project, config.tracking.project);
        assert_eq!(parsed.trainer.timeout_secs, config.trainer.timeout_secs);
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = XrayConfig::default();
        overrides.tracking.project = "domain-shift".to_string();
        overrides.paths.runs_dir = PathBuf::from("/data/runs");

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.tracking.project, "domain-shift");
        assert_eq!(config.paths.runs_dir, PathBuf::from("/data/runs"));
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join(".xrayto3d");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join("config.toml"),
            r#"
[tracking]
backend = "wandb"
entity = "radiology-lab"

[evaluation]
nsd_tolerance = 2.0
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.tracking.backend, TrackingBackend::Wandb);
        assert_eq!(config.tracking.entity.as_deref(), Some("radiology-lab"));
        assert_eq!(config.evaluation.nsd_tolerance, 2.0);
        assert_eq!(config.tracking.project, "2d-3d-benchmark");
    }
}
