//! Run records stored as `run.json` inside each run directory.

use crate::error::MlError;
use crate::persistence::{atomic_write_json, load_json};
use crate::tracking::{RunFilter, RunRecord, RunStore, newest_first};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const RUN_RECORD_FILE: &str = "run.json";

/// Filesystem run store rooted at the runs directory.
pub struct LocalRunStore {
    runs_dir: PathBuf,
}

impl LocalRunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn save(&self, run: &RunRecord) -> Result<PathBuf, MlError> {
        let path = run.run_dir(&self.runs_dir).join(RUN_RECORD_FILE);
        atomic_write_json(&path, run)?;
        Ok(path)
    }

    pub fn load(&self, project: &str, id: &str) -> Result<RunRecord, MlError> {
        let path = self.runs_dir.join(project).join(id).join(RUN_RECORD_FILE);
        load_json(&path)?
            .ok_or_else(|| MlError::not_found(format!("run {id} in project {project}")))
    }
}

#[async_trait]
impl RunStore for LocalRunStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn query(&self, project: &str, filter: &RunFilter) -> Result<Vec<RunRecord>, MlError> {
        let project_dir = self.runs_dir.join(project);
        if !project_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for entry in WalkDir::new(&project_dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| MlError::tracking(e.to_string()))?;
            if entry.file_name() != RUN_RECORD_FILE {
                continue;
            }
            match load_json::<RunRecord>(entry.path()) {
                Ok(Some(run)) if filter.matches(&run) => runs.push(run),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Skipping unreadable run record");
                }
            }
        }
        newest_first(&mut runs);
        Ok(runs)
    }
}
