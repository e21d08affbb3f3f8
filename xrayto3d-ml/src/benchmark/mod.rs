//! Benchmark table generation.
//!
//! Collects finished runs for an anatomy from the run store, averages each run's
//! per-case metric log and renders one LaTeX table row per benchmarked model.

pub mod metric_log;

use crate::anatomy::Anatomy;
use crate::config::PathsConfig;
use crate::error::MlError;
use crate::persistence::atomic_write_json;
use crate::tracking::{RunFilter, RunRecord, RunStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use metric_log::{MetricLog, MetricSummary};

/// A model as it appears in the benchmark table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkModel {
    /// Label used when no run is found.
    pub display_name: &'static str,
    /// `MODEL_NAME` recorded in the run config.
    pub model_name: &'static str,
    /// Parameter count label.
    pub size: &'static str,
}

/// Table rows, in display order.
pub const BENCHMARK_MODELS: [BenchmarkModel; 7] = [
    BenchmarkModel {
        display_name: "UNETR",
        model_name: "UNETR",
        size: "",
    },
    BenchmarkModel {
        display_name: "AttentionUnet",
        model_name: "AttentionUnet",
        size: "1.5M",
    },
    BenchmarkModel {
        display_name: "UNet",
        model_name: "Unet",
        size: "1.2M",
    },
    BenchmarkModel {
        display_name: "MultiScale2DPermuteConcat",
        model_name: "MultiScale2DPermuteConcat",
        size: "3.5M",
    },
    BenchmarkModel {
        display_name: "TwoDPermuteConcat",
        model_name: "TwoDPermuteConcatModel",
        size: "1.2M",
    },
    BenchmarkModel {
        display_name: "OneDConcat",
        model_name: "OneDConcatModel",
        size: "40.6M",
    },
    BenchmarkModel {
        display_name: "TLPredictor",
        model_name: "TLPredictor",
        size: "6.6M",
    },
];

/// Which evaluation of a run to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationScope {
    InDomain,
    DomainShift(String),
}

impl EvaluationScope {
    pub fn from_flags(domain_shift: bool, dataset: Option<&str>) -> Result<Self, MlError> {
        if !domain_shift {
            return Ok(Self::InDomain);
        }
        match dataset {
            Some(ds) if !ds.is_empty() => Ok(Self::DomainShift(ds.to_string())),
            _ => Err(MlError::invalid_input(
                "--domain-shift requires --domain-shift-dataset",
            )),
        }
    }

    /// Subdirectory of the run directory holding the metric log.
    pub fn subdir(&self) -> String {
        match self {
            Self::InDomain => "evaluation".to_string(),
            Self::DomainShift(ds) => format!("domain_shift_{ds}"),
        }
    }

    /// File name of the DSC summary written under the metadata directory.
    pub fn json_name(&self, anatomy: Anatomy) -> String {
        match self {
            Self::InDomain => format!("{anatomy}_indomain.json"),
            Self::DomainShift(ds) => format!("{anatomy}_outdomain_{ds}.json"),
        }
    }
}

/// What to report.
#[derive(Debug, Clone)]
pub struct BenchmarkRequest {
    pub anatomy: Anatomy,
    /// Extra tags every run must carry.
    pub tags: Vec<String>,
    pub scope: EvaluationScope,
    pub save_json: bool,
}

impl BenchmarkRequest {
    pub fn filter(&self) -> RunFilter {
        let mut tags = vec![self.anatomy.to_string()];
        tags.extend(self.tags.iter().cloned());
        RunFilter::finished_with_tags(tags)
    }
}

/// One rendered table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkRow {
    pub name: String,
    pub size: String,
    pub run_id: Option<String>,
    pub metrics: MetricSummary,
}

impl BenchmarkRow {
    pub fn render(&self) -> String {
        format!(
            " & {} & {} & {}  & {} & {}  & {} \\\\",
            self.name,
            self.size,
            fmt_metric(self.metrics.dsc),
            fmt_metric(self.metrics.hd95),
            fmt_metric(self.metrics.asd),
            fmt_metric(self.metrics.nsd),
        )
    }
}

fn fmt_metric(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value:.2}")
    }
}

/// The finished table.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub anatomy: Anatomy,
    pub scope: EvaluationScope,
    pub runs_considered: usize,
    pub rows: Vec<BenchmarkRow>,
    /// Where the DSC summary was written, if requested.
    pub json_path: Option<PathBuf>,
}

impl BenchmarkReport {
    pub fn table(&self) -> String {
        self.rows
            .iter()
            .map(BenchmarkRow::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// `{MODEL_NAME: mean DSC}` for the rows backed by a run whose metric log was
    /// read. Rows reported as NaN for lack of a run or log are left out; `null`
    /// marks a log whose DSC column holds no values.
    pub fn dsc_summary(&self) -> BTreeMap<String, Option<f64>> {
        self.rows
            .iter()
            .filter(|r| r.run_id.is_some())
            .map(|r| {
                let dsc = (!r.metrics.dsc.is_nan()).then_some(r.metrics.dsc);
                (r.name.clone(), dsc)
            })
            .collect()
    }
}

/// Builds benchmark tables from tracked runs.
pub struct BenchmarkReporter<'a> {
    store: &'a dyn RunStore,
    paths: &'a PathsConfig,
    project: String,
}

impl<'a> BenchmarkReporter<'a> {
    pub fn new(store: &'a dyn RunStore, paths: &'a PathsConfig, project: &str) -> Self {
        Self {
            store,
            paths,
            project: project.to_string(),
        }
    }

    /// Build the table. `Ok(None)` when no run matches.
    pub async fn run(&self, request: &BenchmarkRequest) -> Result<Option<BenchmarkReport>, MlError> {
        let runs = self.store.query(&self.project, &request.filter()).await?;
        if runs.is_empty() {
            info!(
                project = %self.project,
                anatomy = %request.anatomy,
                store = self.store.name(),
                "No finished runs found"
            );
            return Ok(None);
        }

        let mut rows = Vec::with_capacity(BENCHMARK_MODELS.len());
        for model in &BENCHMARK_MODELS {
            rows.push(self.row(model, &runs, &request.scope).await);
        }

        let mut report = BenchmarkReport {
            anatomy: request.anatomy,
            scope: request.scope.clone(),
            runs_considered: runs.len(),
            rows,
            json_path: None,
        };

        if request.save_json {
            let path = self
                .paths
                .metadata_dir
                .join(request.scope.json_name(request.anatomy));
            atomic_write_json(&path, &report.dsc_summary())?;
            info!(path = %path.display(), "Wrote DSC summary");
            report.json_path = Some(path);
        }
        Ok(Some(report))
    }

    async fn row(
        &self,
        model: &BenchmarkModel,
        runs: &[RunRecord],
        scope: &EvaluationScope,
    ) -> BenchmarkRow {
        let missing = |reason: &str| {
            warn!(model = model.display_name, reason, "Reporting NaN");
            BenchmarkRow {
                name: model.display_name.to_string(),
                size: model.size.to_string(),
                run_id: None,
                metrics: MetricSummary::nan(),
            }
        };

        let Some(run) = runs.iter().find(|r| r.model_name() == Some(model.model_name)) else {
            return missing("no matching run");
        };
        let path = self.metric_log_path(run, scope);
        let log = match MetricLog::load(&path).await {
            Ok(log) => log,
            Err(e) => return missing(&e.to_string()),
        };

        BenchmarkRow {
            name: run.model_name().unwrap_or(model.model_name).to_string(),
            size: model.size.to_string(),
            run_id: Some(run.id.clone()),
            metrics: log.summary(),
        }
    }

    /// `{runs_dir}/{project}/{run_id}/{subdir}/{metric_log_name}`
    pub fn metric_log_path(&self, run: &RunRecord, scope: &EvaluationScope) -> PathBuf {
        metric_log_path(self.paths, run, scope)
    }
}

pub fn metric_log_path(paths: &PathsConfig, run: &RunRecord, scope: &EvaluationScope) -> PathBuf {
    run.run_dir(Path::new(&paths.runs_dir))
        .join(scope.subdir())
        .join(&paths.metric_log_name)
}
