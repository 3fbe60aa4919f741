//! Dataset Table
//!
//! Named tabular/geospatial datasets handed to a generated script, each with a
//! natural-language analysis summary written by the upstream collaborators.

use crate::error::{CityQueryError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Column names that mark a dataset as spatial
const GEOMETRY_COLUMNS: &[&str] = &["geometry", "geometry_wkt"];

/// In-memory string table (header + rows)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableContent {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableContent {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(CityQueryError::Dataset(format!(
                    "row {} has {} fields, expected {}",
                    i,
                    row.len(),
                    columns.len()
                )));
            }
        }
        Ok(Self { columns, rows })
    }

    /// Read a CSV file with a header row
    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(false)
            .from_path(path)
            .map_err(|e| CityQueryError::Dataset(format!("{}: {}", path.display(), e)))?;

        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            rows.push(record.iter().map(|f| f.to_string()).collect());
        }

        Ok(Self { columns, rows })
    }

    /// Write the table as CSV, header first
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// First geometry-bearing column, if any
    pub fn geometry_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| GEOMETRY_COLUMNS.iter().any(|g| c.eq_ignore_ascii_case(g)))
            .map(|c| c.as_str())
    }

    pub fn is_spatial(&self) -> bool {
        self.geometry_column().is_some()
    }
}

/// One named dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub content: TableContent,
    pub summary: String,
}

/// Ordered, read-only collection of datasets for one question
#[derive(Debug, Clone, Default)]
pub struct DatasetTable {
    datasets: Vec<Dataset>,
}

impl DatasetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dataset; names must be unique within the table
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        content: TableContent,
        summary: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(CityQueryError::Dataset(format!("duplicate dataset name '{}'", name)));
        }
        self.datasets.push(Dataset {
            name,
            content,
            summary: summary.into(),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// (name, row count) for every dataset, in table order
    pub fn row_counts(&self) -> Vec<(String, usize)> {
        self.datasets
            .iter()
            .map(|d| (d.name.clone(), d.content.row_count()))
            .collect()
    }
}

/// Geocoded target location for the question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    name: String,
    path: PathBuf,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    datasets: Vec<ManifestEntry>,
    #[serde(default)]
    locations: Vec<Location>,
}

/// Datasets and locations loaded from a JSON manifest
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub datasets: DatasetTable,
    pub locations: Vec<Location>,
}

impl Manifest {
    /// Load a manifest; dataset paths are resolved relative to the manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let file: ManifestFile = serde_json::from_str(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut datasets = DatasetTable::new();
        for entry in file.datasets {
            let csv_path = if entry.path.is_absolute() {
                entry.path.clone()
            } else {
                base.join(&entry.path)
            };
            let content = TableContent::from_csv_path(&csv_path)?;
            tracing::debug!(
                "Loaded dataset '{}' ({} rows) from {}",
                entry.name,
                content.row_count(),
                csv_path.display()
            );
            datasets.insert(entry.name, content, entry.summary)?;
        }

        Ok(Self {
            datasets,
            locations: file.locations,
        })
    }
}
