//! Python subprocess runner for the external trainer.
//!
//! The trainer's progress output (stderr) is passed through to the terminal;
//! stdout is captured and carries the JSON result.

use crate::config::TrainerConfig;
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Information about the Python interpreter a run used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub venv_path: Option<PathBuf>,
}

/// Managed Python subprocess runner.
pub struct PythonRuntime {
    python_path: PathBuf,
    venv_path: Option<PathBuf>,
    workspace: PathBuf,
    timeout: Duration,
}

impl PythonRuntime {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            venv_path: None,
            workspace,
            timeout: Duration::from_secs(300),
        }
    }

    /// Build from the `[trainer]` config section; falls back to `$VIRTUAL_ENV`.
    pub fn from_config(config: &TrainerConfig, workspace: PathBuf) -> Self {
        Self {
            python_path: config.python_path.clone(),
            venv_path: config.venv_path.clone().or_else(detect_venv),
            workspace,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get the effective Python command (accounting for venv).
    fn python_cmd(&self) -> PathBuf {
        if let Some(venv) = &self.venv_path {
            let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
            venv.join(bin_dir).join("python")
        } else {
            self.python_path.clone()
        }
    }

    /// Interpreter version, `None` when it cannot be started.
    pub async fn info(&self) -> Option<PythonInfo> {
        let output = Command::new(self.python_cmd())
            .arg("--version")
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            version = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }
        Some(PythonInfo {
            path: self.python_cmd(),
            version,
            venv_path: self.venv_path.clone(),
        })
    }

    /// Run a Python script file and return its stdout.
    pub async fn run_script_file(
        &self,
        script_path: &Path,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String, MlError> {
        let timeout = timeout.unwrap_or(self.timeout);
        debug!(script = %script_path.display(), ?args, "Running Python script");

        let result = tokio::time::timeout(timeout, async {
            let output = Command::new(self.python_cmd())
                .arg(script_path)
                .args(args)
                .current_dir(&self.workspace)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| MlError::Python(format!("Failed to spawn Python: {e}")))?;

            if !output.status.success() {
                return Err(MlError::Python(format!(
                    "{} failed (exit {})",
                    script_path.display(),
                    output.status
                )));
            }

            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(MlError::Timeout(format!(
                "{} timed out after {}s",
                script_path.display(),
                timeout.as_secs()
            ))),
        }
    }
}

fn detect_venv() -> Option<PathBuf> {
    std::env::var_os("VIRTUAL_ENV")
        .map(PathBuf::from)
        .filter(|p| p.exists())
}
