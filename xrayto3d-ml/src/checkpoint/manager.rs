//! Checkpoint discovery and retention in a run's checkpoint directory.

use crate::error::MlError;
use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

pub const CHECKPOINT_EXTENSION: &str = "safetensors";
pub const LAST_CHECKPOINT_STEM: &str = "last";

/// Template the trainer expands for monitored checkpoints.
pub const FILENAME_TEMPLATE: &str =
    "epoch={epoch}-step={step}-val_loss={val/loss:.2f}-val_acc={val/dice:.2f}";

/// A formatted metric: fixed-point, infinite or NaN, as Python or Rust prints it.
const METRIC: &str = r"(-?(?:\d+(?:\.\d+)?|inf)|nan|NaN)";

static FILENAME_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^epoch=(\d+)-step=(\d+)-val_loss={METRIC}-val_acc={METRIC}$"
    ))
});

fn filename_re() -> Result<&'static Regex, MlError> {
    FILENAME_RE
        .as_ref()
        .map_err(|e| MlError::checkpoint(format!("invalid checkpoint name pattern: {e}")))
}

/// Metrics encoded in a monitored checkpoint's file name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointTag {
    pub epoch: usize,
    pub step: usize,
    pub val_loss: f64,
    pub val_dice: f64,
}

impl CheckpointTag {
    /// Render the file stem.
    pub fn file_stem(&self) -> String {
        format!(
            "epoch={}-step={}-val_loss={:.2}-val_acc={:.2}",
            self.epoch, self.step, self.val_loss, self.val_dice
        )
    }

    /// `Ok(None)` when the stem is not a monitored checkpoint name.
    pub fn parse(stem: &str) -> Result<Option<Self>, MlError> {
        Ok(filename_re()?
            .captures(stem)
            .and_then(|caps| Self::from_captures(&caps)))
    }

    fn from_captures(caps: &Captures<'_>) -> Option<Self> {
        Some(Self {
            epoch: caps[1].parse().ok()?,
            step: caps[2].parse().ok()?,
            val_loss: caps[3].parse().ok()?,
            val_dice: caps[4].parse().ok()?,
        })
    }
}

/// A checkpoint file on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub path: PathBuf,
    /// `None` for the rolling `last` checkpoint.
    pub tag: Option<CheckpointTag>,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn is_last(&self) -> bool {
        self.path
            .file_stem()
            .is_some_and(|s| s == LAST_CHECKPOINT_STEM)
    }
}

/// Checkpoint manager for one checkpoint directory.
pub struct CheckpointManager {
    dir: PathBuf,
    /// How many monitored checkpoints to keep; `None` keeps all.
    top_k: Option<usize>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, top_k: Option<usize>) -> Self {
        Self {
            dir: dir.into(),
            top_k,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List checkpoint files, unordered.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>, MlError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| MlError::checkpoint(e.to_string()))?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().is_none_or(|ext| ext != CHECKPOINT_EXTENSION)
            {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| MlError::checkpoint(e.to_string()))?;
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            entries.push(CheckpointEntry {
                path: path.to_path_buf(),
                tag: CheckpointTag::parse(&stem)?,
                size_bytes: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from)?,
            });
        }
        Ok(entries)
    }

    /// Most recently written checkpoint.
    pub fn latest(&self) -> Result<CheckpointEntry, MlError> {
        self.list()?
            .into_iter()
            .max_by(|a, b| {
                a.modified
                    .cmp(&b.modified)
                    .then_with(|| step_of(a).cmp(&step_of(b)))
            })
            .ok_or_else(|| {
                MlError::not_found(format!("no checkpoints in {}", self.dir.display()))
            })
    }

    /// Monitored checkpoint with the lowest validation loss.
    pub fn best(&self) -> Result<Option<CheckpointEntry>, MlError> {
        Ok(self
            .monitored()?
            .into_iter()
            .min_by(|a, b| loss_of(a).total_cmp(&loss_of(b))))
    }

    /// Delete monitored checkpoints beyond `top_k`, best first. `last` is never removed.
    pub fn enforce_retention(&self) -> Result<Vec<PathBuf>, MlError> {
        let Some(keep) = self.top_k else {
            return Ok(Vec::new());
        };
        let mut monitored = self.monitored()?;
        monitored.sort_by(|a, b| loss_of(a).total_cmp(&loss_of(b)));

        let mut removed = Vec::new();
        for entry in monitored.into_iter().skip(keep) {
            std::fs::remove_file(&entry.path)?;
            tracing::debug!(path = %entry.path.display(), "Removed checkpoint");
            removed.push(entry.path);
        }
        Ok(removed)
    }

    fn monitored(&self) -> Result<Vec<CheckpointEntry>, MlError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|e| e.tag.is_some() && !e.is_last())
            .collect())
    }
}

/// Resolve a checkpoint argument: a file is used as-is, a directory yields its latest.
pub fn resolve_checkpoint(path: &Path) -> Result<PathBuf, MlError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.exists() {
        return Err(MlError::not_found(format!(
            "checkpoint path {} does not exist",
            path.display()
        )));
    }
    Ok(CheckpointManager::new(path, None).latest()?.path)
}

fn step_of(entry: &CheckpointEntry) -> usize {
    entry.tag.map(|t| t.step).unwrap_or(0)
}

fn loss_of(entry: &CheckpointEntry) -> f64 {
    entry
        .tag
        .map(|t| t.val_loss)
        .filter(|l| !l.is_nan())
        .unwrap_or(f64::INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"weights").unwrap();
        path
    }

    fn tag(epoch: usize, loss: f64) -> CheckpointTag {
        CheckpointTag {
            epoch,
            step: epoch * 100,
            val_loss: loss,
            val_dice: 0.8,
        }
    }

    #[test]
    fn test_filename_roundtrip() {
        let t = tag(3, 0.4567);
        let stem = t.file_stem();
        assert_eq!(stem, "epoch=3-step=300-val_loss=0.46-val_acc=0.80");
        let parsed = CheckpointTag::parse(&stem).unwrap().unwrap();
        assert_eq!(parsed.epoch, 3);
        assert_eq!(parsed.step, 300);
        assert_eq!(parsed.val_loss, 0.46);
        assert!(CheckpointTag::parse("last").unwrap().is_none());
    }

    #[test]
    fn test_name_pattern_compiles() {
        assert!(filename_re().is_ok());
    }

    #[test]
    fn test_non_finite_metrics_parse() {
        let parsed = CheckpointTag::parse("epoch=4-step=400-val_loss=inf-val_acc=0.00")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.val_loss, f64::INFINITY);

        let parsed = CheckpointTag::parse("epoch=5-step=500-val_loss=-inf-val_acc=nan")
            .unwrap()
            .unwrap();
        assert_eq!(parsed.val_loss, f64::NEG_INFINITY);
        assert!(parsed.val_dice.is_nan());

        let stem = tag(6, f64::NAN).file_stem();
        assert!(CheckpointTag::parse(&stem).unwrap().unwrap().val_loss.is_nan());
    }

    #[test]
    fn test_infinite_loss_is_pruned_first() {
        let dir = TempDir::new().unwrap();
        let diverged = touch(dir.path(), "epoch=0-step=10-val_loss=inf-val_acc=0.00.safetensors");
        touch(dir.path(), &format!("{}.safetensors", tag(1, 0.7).file_stem()));
        touch(dir.path(), "last.safetensors");

        let manager = CheckpointManager::new(dir.path(), Some(1));
        assert_eq!(manager.enforce_retention().unwrap(), vec![diverged]);
        assert_eq!(manager.best().unwrap().unwrap().tag.unwrap().epoch, 1);
    }

    #[test]
    fn test_best_and_retention() {
        let dir = TempDir::new().unwrap();
        for (epoch, loss) in [(1, 0.9), (2, 0.3), (3, 0.5)] {
            touch(dir.path(), &format!("{}.safetensors", tag(epoch, loss).file_stem()));
        }
        touch(dir.path(), "last.safetensors");
        touch(dir.path(), "notes.txt");

        let manager = CheckpointManager::new(dir.path(), Some(1));
        assert_eq!(manager.list().unwrap().len(), 4);
        let best = manager.best().unwrap().unwrap();
        assert_eq!(best.tag.unwrap().epoch, 2);

        let removed = manager.enforce_retention().unwrap();
        assert_eq!(removed.len(), 2);
        let remaining = manager.list().unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(CheckpointEntry::is_last));
    }

    #[test]
    fn test_unbounded_top_k_keeps_all() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), &format!("{}.safetensors", tag(1, 0.2).file_stem()));
        touch(dir.path(), &format!("{}.safetensors", tag(2, 0.1).file_stem()));
        let manager = CheckpointManager::new(dir.path(), None);
        assert!(manager.enforce_retention().unwrap().is_empty());
        assert_eq!(manager.list().unwrap().len(), 2);
    }

    #[test]
    fn test_latest_in_empty_dir_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = CheckpointManager::new(dir.path(), None).latest().unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }

    #[test]
    fn test_resolve_checkpoint_file_and_dir() {
        let dir = TempDir::new().unwrap();
        let file = touch(dir.path(), "last.safetensors");
        assert_eq!(resolve_checkpoint(&file).unwrap(), file);
        assert_eq!(resolve_checkpoint(dir.path()).unwrap(), file);
        assert!(matches!(
            resolve_checkpoint(&dir.path().join("missing")),
            Err(MlError::NotFound(_))
        ));
    }
}
