//! Per-case evaluation metric logs (`metric-log.csv`).

use crate::data::csv::CsvTable;
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DSC: &str = "DSC";
pub const HD95: &str = "HD95";
pub const ASD: &str = "ASD";
pub const NSD: &str = "NSD";

/// Cell texts read as missing values, the same set pandas treats as NA by default.
pub const NA_TOKENS: [&str; 19] = [
    "", "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

fn is_na(cell: &str) -> bool {
    NA_TOKENS.contains(&cell)
}

/// Mean shape-reconstruction metrics; `NaN` when unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub dsc: f64,
    pub hd95: f64,
    pub asd: f64,
    pub nsd: f64,
}

impl MetricSummary {
    pub fn nan() -> Self {
        Self {
            dsc: f64::NAN,
            hd95: f64::NAN,
            asd: f64::NAN,
            nsd: f64::NAN,
        }
    }

    pub fn is_complete(&self) -> bool {
        [self.dsc, self.hd95, self.asd, self.nsd]
            .iter()
            .all(|v| !v.is_nan())
    }
}

/// A parsed metric log.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricLog {
    table: CsvTable,
}

impl MetricLog {
    pub fn from_table(table: CsvTable) -> Self {
        Self { table }
    }

    /// Read a metric log. A missing file is a not-found error.
    pub async fn load(path: &Path) -> Result<Self, MlError> {
        if !path.is_file() {
            return Err(MlError::not_found(format!(
                "metric log {}",
                path.display()
            )));
        }
        Ok(Self::from_table(CsvTable::load(path).await?))
    }

    pub fn cases(&self) -> usize {
        self.table.rows.len()
    }

    /// Unweighted mean of a numeric column, skipping missing cells ([`NA_TOKENS`]).
    ///
    /// `None` when the column is absent or holds any other non-numeric text.
    pub fn mean(&self, column: &str) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for cell in self.table.column(column)? {
            let Some(cell) = cell.filter(|c| !is_na(c)) else {
                continue;
            };
            let value: f64 = cell.parse().ok()?;
            if value.is_nan() {
                continue;
            }
            sum += value;
            count += 1;
        }
        if count == 0 {
            Some(f64::NAN)
        } else {
            Some(sum / count as f64)
        }
    }

    /// Column means of the four reported metrics; missing columns become `NaN`.
    pub fn summary(&self) -> MetricSummary {
        let mean = |c| self.mean(c).unwrap_or(f64::NAN);
        MetricSummary {
            dsc: mean(DSC),
            hd95: mean(HD95),
            asd: mean(ASD),
            nsd: mean(NSD),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(content: &str) -> MetricLog {
        MetricLog::from_table(CsvTable::parse(content, ',').unwrap())
    }

    #[test]
    fn test_means_skip_nan_and_empty() {
        let log = log("subject-id,DSC,HD95,ASD,NSD\ns1,0.9,2.0,0.5,0.8\ns2,0.7,nan,0.7,\ns3,,4.0,0.6,0.6\n");
        let summary = log.summary();
        assert!((summary.dsc - 0.8).abs() < 1e-12);
        assert!((summary.hd95 - 3.0).abs() < 1e-12);
        assert!((summary.asd - 0.6).abs() < 1e-12);
        assert!((summary.nsd - 0.7).abs() < 1e-12);
        assert_eq!(log.cases(), 3);
    }

    #[test]
    fn test_na_tokens_are_skipped() {
        let summary = log("subject-id,DSC,HD95\ns1,0.9,2\ns2,NA,NA\n").summary();
        assert_eq!(summary.dsc, 0.9);
        assert_eq!(summary.hd95, 2.0);

        for token in NA_TOKENS {
            let column = log(&format!("ASD\n1.0\n{token}\n3.0\n"));
            assert_eq!(column.mean(ASD), Some(2.0), "{token:?}");
        }
    }

    #[test]
    fn test_missing_and_text_columns_are_nan() {
        let metrics = log("subject-id,DSC,HD95\ns1,0.9,n/a\ns2,0.7,None\n");
        let summary = metrics.summary();
        assert!((summary.dsc - 0.8).abs() < 1e-12);
        assert!(summary.hd95.is_nan());
        assert!(summary.asd.is_nan());
        assert!(!summary.is_complete());
        assert_eq!(metrics.mean("subject-id"), None);
        assert_eq!(log("DSC\n0.9\nfailed\n").mean(DSC), None);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let err = MetricLog::load(Path::new("/nonexistent/metric-log.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }
}
