//! Training metrics reported back by the trainer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Per-epoch history of a fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    #[serde(default)]
    pub global_step: usize,
    #[serde(default)]
    pub loss_history: Vec<f64>,
    #[serde(default)]
    pub val_loss_history: Vec<f64>,
    /// Other logged series, keyed by metric name (`val/dice`, ...).
    #[serde(default)]
    pub custom_metrics: HashMap<String, Vec<f64>>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    #[serde(default)]
    pub best_checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, loss: f64, val_loss: Option<f64>) {
        self.loss_history.push(loss);
        if let Some(vl) = val_loss {
            self.val_loss_history.push(vl);
        }
        self.epochs_completed += 1;

        let check_loss = val_loss.unwrap_or(loss);
        if self.best_loss.is_none_or(|best| check_loss < best) {
            self.best_loss = Some(check_loss);
            self.best_epoch = Some(self.epochs_completed);
        }
    }

    pub fn add_custom_metric(&mut self, name: &str, value: f64) {
        self.custom_metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    /// Last logged value of a custom metric.
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.custom_metrics.get(name).and_then(|v| v.last().copied())
    }
}
