//! Experiment tracking: run records and the stores that hold them.

pub mod local;
pub mod wandb;

use crate::config::{TrackingBackend, TrackingConfig};
use crate::error::MlError;
use crate::training::metrics::TrainingMetrics;
use crate::training::reproducibility::EnvironmentSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use local::LocalRunStore;
pub use wandb::WandbRunStore;

/// Config key holding the architecture name a run trained.
pub const MODEL_NAME_KEY: &str = "MODEL_NAME";

/// Lifecycle state of a tracked run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Finished,
    Failed,
    Crashed,
    Killed,
    #[serde(other)]
    Unknown,
}

/// A tracked training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub project: String,
    pub group: String,
    pub tags: Vec<String>,
    /// Hyperparameter snapshot.
    pub config: serde_json::Map<String, serde_json::Value>,
    pub state: RunState,
    #[serde(default)]
    pub metrics: Option<TrainingMetrics>,
    #[serde(default)]
    pub environment: Option<EnvironmentSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        project: &str,
        group: &str,
        tags: Vec<String>,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        let id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        Self {
            id,
            project: project.to_string(),
            group: group.to_string(),
            tags,
            config,
            state: RunState::Running,
            metrics: None,
            environment: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn model_name(&self) -> Option<&str> {
        self.config.get(MODEL_NAME_KEY).and_then(|v| v.as_str())
    }

    /// `{runs_dir}/{project}/{id}`
    pub fn run_dir(&self, runs_dir: &Path) -> PathBuf {
        runs_dir.join(&self.project).join(&self.id)
    }

    pub fn set_state(&mut self, state: RunState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// Which runs a query returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    /// Every tag must be present on the run.
    pub tags: Vec<String>,
    pub state: Option<RunState>,
}

impl RunFilter {
    pub fn finished_with_tags(tags: Vec<String>) -> Self {
        Self {
            tags,
            state: Some(RunState::Finished),
        }
    }

    pub fn matches(&self, run: &RunRecord) -> bool {
        self.state.is_none_or(|s| s == run.state)
            && self.tags.iter().all(|t| run.tags.contains(t))
    }
}

/// Read access to tracked runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    fn name(&self) -> &str;

    /// Runs of `project` matching `filter`, newest first.
    async fn query(&self, project: &str, filter: &RunFilter) -> Result<Vec<RunRecord>, MlError>;
}

/// Open the store selected in configuration.
pub fn open_store(config: &TrackingConfig, runs_dir: &Path) -> Result<Box<dyn RunStore>, MlError> {
    match config.backend {
        TrackingBackend::Local => Ok(Box::new(LocalRunStore::new(runs_dir))),
        TrackingBackend::Wandb => Ok(Box::new(WandbRunStore::from_config(config)?)),
    }
}

pub(crate) fn newest_first(runs: &mut [RunRecord]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
