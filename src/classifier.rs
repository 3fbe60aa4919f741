//! Failure Classifier
//!
//! Maps a failed attempt to repair categories, most specific first.

use crate::dataset::DatasetTable;
use crate::sandbox::{ExecutionOutcome, ExecutionReport};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which dataset side came back empty around the target location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistanceSide {
    Buildings,
    Emissions,
}

/// Repair category taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    SyntaxSpacing,
    IndentationMissing,
    MalformedExceptionBlock,
    NumericConversion,
    /// Likely radius or location problem; carries (dataset, rows) for every dataset
    EmptyResultGeneric { row_counts: Vec<(String, usize)> },
    DistanceTooSmall(DistanceSide),
    EmptyInput,
    InvalidEmissionData,
    NoMatchingData,
    MissingOutputFile,
    ExecutionError(String),
    OutputShape(String),
    UpstreamUnavailable(String),
}

impl FailureCategory {
    /// Stable kebab-case tag
    pub fn tag(&self) -> &'static str {
        match self {
            FailureCategory::SyntaxSpacing => "syntax-spacing",
            FailureCategory::IndentationMissing => "indentation-missing",
            FailureCategory::MalformedExceptionBlock => "malformed-exception-block",
            FailureCategory::NumericConversion => "numeric-conversion",
            FailureCategory::EmptyResultGeneric { .. } => "empty-result-generic",
            FailureCategory::DistanceTooSmall(_) => "distance-too-small",
            FailureCategory::EmptyInput => "empty-input",
            FailureCategory::InvalidEmissionData => "invalid-emission-data",
            FailureCategory::NoMatchingData => "no-matching-data",
            FailureCategory::MissingOutputFile => "missing-output-file",
            FailureCategory::ExecutionError(_) => "execution-error",
            FailureCategory::OutputShape(_) => "output-shape",
            FailureCategory::UpstreamUnavailable(_) => "upstream-unavailable",
        }
    }

    /// Categories that call for the larger empty-result guidance
    pub fn is_empty_result(&self) -> bool {
        matches!(
            self,
            FailureCategory::EmptyResultGeneric { .. }
                | FailureCategory::DistanceTooSmall(_)
                | FailureCategory::EmptyInput
                | FailureCategory::InvalidEmissionData
                | FailureCategory::NoMatchingData
                | FailureCategory::MissingOutputFile
        )
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCategory::EmptyResultGeneric { row_counts } => {
                let counts: Vec<String> = row_counts
                    .iter()
                    .map(|(name, rows)| format!("{}: {} rows", name, rows))
                    .collect();
                write!(f, "{} ({})", self.tag(), counts.join(", "))
            }
            FailureCategory::DistanceTooSmall(DistanceSide::Buildings) => {
                write!(f, "{} (buildings)", self.tag())
            }
            FailureCategory::DistanceTooSmall(DistanceSide::Emissions) => {
                write!(f, "{} (emissions)", self.tag())
            }
            FailureCategory::ExecutionError(msg)
            | FailureCategory::OutputShape(msg)
            | FailureCategory::UpstreamUnavailable(msg) => write!(f, "{} ({})", self.tag(), msg),
            _ => write!(f, "{}", self.tag()),
        }
    }
}

/// Substrings of the exception text, lower-cased
const EXCEPTION_MARKERS: &[(&str, FailureCategory)] = &[
    ("invalid syntax", FailureCategory::SyntaxSpacing),
    ("expected an indented block", FailureCategory::IndentationMissing),
    ("expected 'except' or 'finally' block", FailureCategory::MalformedExceptionBlock),
    ("could not convert string to numeric", FailureCategory::NumericConversion),
];

/// Substrings of the diagnostic output, lower-cased
const DIAGNOSTIC_MARKERS: &[(&str, FailureCategory)] = &[
    (
        "no buildings found near location",
        FailureCategory::DistanceTooSmall(DistanceSide::Buildings),
    ),
    (
        "no emission zones found near location",
        FailureCategory::DistanceTooSmall(DistanceSide::Emissions),
    ),
    ("input dataset is empty", FailureCategory::EmptyInput),
    ("invalid emission data", FailureCategory::InvalidEmissionData),
    ("cannot perform matching", FailureCategory::NoMatchingData),
];

/// Failure classifier
pub struct FailureClassifier;

impl FailureClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Categories for one attempt. Empty for `SuccessWithRows`, non-empty
    /// for every other outcome.
    ///
    /// Exception markers only look at what the script raised; printed output
    /// is matched against the diagnostic markers alone.
    pub fn classify(&self, report: &ExecutionReport, datasets: &DatasetTable) -> Vec<FailureCategory> {
        let outcome = &report.outcome;
        if outcome.is_success() {
            return Vec::new();
        }

        let mut categories = Vec::new();
        let diagnostics = report.diagnostics().to_lowercase();
        let mut exception_text = String::new();
        if let ExecutionOutcome::RuntimeFailure(msg) = outcome {
            exception_text.push_str(&msg.to_lowercase());
        }
        if let Some(exception) = &report.exception {
            exception_text.push('\n');
            exception_text.push_str(&exception.to_lowercase());
        }

        for (marker, category) in EXCEPTION_MARKERS {
            if exception_text.contains(marker) {
                categories.push(category.clone());
            }
        }
        let exception_matched = !categories.is_empty();

        match outcome {
            ExecutionOutcome::NoArtifact => categories.push(FailureCategory::MissingOutputFile),
            ExecutionOutcome::MalformedArtifact(reason) => {
                categories.push(FailureCategory::OutputShape(reason.clone()))
            }
            _ => {}
        }

        let mut diagnostic_matched = false;
        for (marker, category) in DIAGNOSTIC_MARKERS {
            if diagnostics.contains(marker) {
                categories.push(category.clone());
                diagnostic_matched = true;
            }
        }

        match outcome {
            ExecutionOutcome::RuntimeFailure(msg) if categories.is_empty() => {
                categories.push(FailureCategory::ExecutionError(msg.clone()));
            }
            ExecutionOutcome::SuccessEmpty | ExecutionOutcome::NoArtifact
                if !exception_matched && !diagnostic_matched =>
            {
                categories.push(FailureCategory::EmptyResultGeneric {
                    row_counts: datasets.row_counts(),
                });
            }
            _ => {}
        }

        categories
    }

    /// Categories for an attempt whose script never arrived
    pub fn classify_upstream(&self, message: &str) -> Vec<FailureCategory> {
        vec![FailureCategory::UpstreamUnavailable(message.to_string())]
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}
