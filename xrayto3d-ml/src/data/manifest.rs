//! Dataset manifests: one row per case with AP view, LAT view and segmentation paths.

use crate::data::csv::CsvTable;
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const AP_COLUMN: &str = "ap";
pub const LAT_COLUMN: &str = "lat";
pub const SEG_COLUMN: &str = "seg";

/// One training/evaluation case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub ap: PathBuf,
    pub lat: PathBuf,
    pub seg: PathBuf,
}

/// A parsed manifest file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub path: PathBuf,
    pub samples: Vec<SampleRecord>,
}

impl DatasetManifest {
    pub async fn load(path: &Path) -> Result<Self, MlError> {
        let table = CsvTable::load(path).await?;
        Self::from_table(path, &table)
    }

    pub fn from_table(path: &Path, table: &CsvTable) -> Result<Self, MlError> {
        let index = |name: &str| {
            table.column_index(name).ok_or_else(|| {
                MlError::dataset(format!(
                    "{} is missing the '{name}' column (found: {})",
                    path.display(),
                    table.columns.join(", ")
                ))
            })
        };
        let (ap, lat, seg) = (index(AP_COLUMN)?, index(LAT_COLUMN)?, index(SEG_COLUMN)?);

        let mut samples = Vec::with_capacity(table.rows.len());
        for (line, row) in table.rows.iter().enumerate() {
            let cell = |idx: usize| {
                row.get(idx)
                    .filter(|c| !c.is_empty())
                    .map(PathBuf::from)
                    .ok_or_else(|| {
                        MlError::dataset(format!(
                            "{} row {}: missing path",
                            path.display(),
                            line + 2
                        ))
                    })
            };
            samples.push(SampleRecord {
                ap: cell(ap)?,
                lat: cell(lat)?,
                seg: cell(seg)?,
            });
        }

        if samples.is_empty() {
            return Err(MlError::dataset(format!(
                "{} contains no samples",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            samples,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("femur_train.csv");
        std::fs::write(
            &path,
            "ap,lat,seg\ns1_ap.png,s1_lat.png,s1_seg.nii.gz\ns2_ap.png,s2_lat.png,s2_seg.nii.gz\n",
        )
        .unwrap();

        let manifest = DatasetManifest::load(&path).await.unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.samples[1].seg, PathBuf::from("s2_seg.nii.gz"));
    }

    #[test]
    fn test_missing_column() {
        let table = CsvTable::parse("ap,lat\na,b\n", ',').unwrap();
        let err = DatasetManifest::from_table(Path::new("m.csv"), &table).unwrap_err();
        assert!(err.to_string().contains("'seg'"));
    }

    #[test]
    fn test_empty_cell_reports_row() {
        let table = CsvTable::parse("ap,lat,seg\na,,c\n", ',').unwrap();
        let err = DatasetManifest::from_table(Path::new("m.csv"), &table).unwrap_err();
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn test_header_only_is_error() {
        let table = CsvTable::parse("ap,lat,seg\n", ',').unwrap();
        assert!(DatasetManifest::from_table(Path::new("m.csv"), &table).is_err());
    }
}
