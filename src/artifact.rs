//! Result artifact
//!
//! The CSV a generated script writes: exactly `name`, `longitude`, `latitude`.

use crate::error::{CityQueryError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const RESULT_COLUMNS: [&str; 3] = ["name", "longitude", "latitude"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub name: String,
    pub longitude: f64,
    pub latitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Write the table with its three-column header; an empty table still
    /// gets the header.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(RESULT_COLUMNS)?;
        for row in &self.rows {
            writer.write_record([
                row.name.clone(),
                row.longitude.to_string(),
                row.latitude.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// What was found at the artifact path after an attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactState {
    Missing,
    Table(ResultTable),
    Malformed(String),
}

/// Inspect the artifact at `path`
pub fn inspect(path: &Path) -> Result<ArtifactState> {
    if !path.exists() {
        return Ok(ArtifactState::Missing);
    }

    let mut reader = match csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path) {
        Ok(reader) => reader,
        Err(e) => return Err(CityQueryError::Artifact(format!("{}: {}", path.display(), e))),
    };

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h.iter().map(|c| c.to_string()).collect(),
        Err(e) => return Ok(ArtifactState::Malformed(format!("unreadable header: {}", e))),
    };
    if headers.iter().map(|h| h.as_str()).ne(RESULT_COLUMNS.iter().copied()) {
        return Ok(ArtifactState::Malformed(format!(
            "expected columns [name, longitude, latitude], found [{}]",
            headers.join(", ")
        )));
    }

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => return Ok(ArtifactState::Malformed(format!("row {}: {}", i + 1, e))),
        };
        let longitude = match parse_coordinate(record.get(1), -180.0, 180.0) {
            Some(v) => v,
            None => {
                return Ok(ArtifactState::Malformed(format!(
                    "row {}: invalid longitude '{}'",
                    i + 1,
                    record.get(1).unwrap_or_default()
                )))
            }
        };
        let latitude = match parse_coordinate(record.get(2), -90.0, 90.0) {
            Some(v) => v,
            None => {
                return Ok(ArtifactState::Malformed(format!(
                    "row {}: invalid latitude '{}'",
                    i + 1,
                    record.get(2).unwrap_or_default()
                )))
            }
        };
        rows.push(ResultRow {
            name: record.get(0).unwrap_or_default().to_string(),
            longitude,
            latitude,
        });
    }

    Ok(ArtifactState::Table(ResultTable { rows }))
}

fn parse_coordinate(raw: Option<&str>, min: f64, max: f64) -> Option<f64> {
    let value = raw?.parse::<f64>().ok()?;
    if value.is_finite() && (min..=max).contains(&value) {
        Some(value)
    } else {
        None
    }
}
