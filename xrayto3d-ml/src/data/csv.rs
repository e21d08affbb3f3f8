//! Minimal delimited-text reader for dataset manifests and metric logs.
//!
//! Cells may be double-quoted; a quoted cell can hold the delimiter and `""`
//! stands for a literal quote. Quoted newlines are not supported.

use crate::error::MlError;
use std::path::Path;

/// A header row plus string cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsvTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn split_cells(line: &str, delimiter: char) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            c if c == delimiter && !quoted => {
                cells.push(cell.trim().to_string());
                cell.clear();
            }
            c => cell.push(c),
        }
    }
    cells.push(cell.trim().to_string());
    cells
}

impl CsvTable {
    pub fn parse(content: &str, delimiter: char) -> Result<Self, MlError> {
        let mut lines = content.lines();

        let columns = split_cells(
            lines
                .next()
                .ok_or_else(|| MlError::dataset("Empty CSV file"))?,
            delimiter,
        );

        let mut rows = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            rows.push(split_cells(line, delimiter));
        }

        Ok(Self { columns, rows })
    }

    /// Read and parse a comma-separated file.
    pub async fn load(path: &Path) -> Result<Self, MlError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MlError::dataset(format!("Failed to read {}: {e}", path.display())))?;
        Self::parse(&content, ',')
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cells of one column; short rows yield `None`.
    pub fn column(&self, name: &str) -> Option<impl Iterator<Item = Option<&str>>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(move |row| row.get(idx).map(String::as_str)))
    }
}
