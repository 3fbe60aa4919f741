//! Execution Sandbox Runner
//!
//! Runs a sanitized script in a separate interpreter process. The workspace
//! holds read-only dataset copies, a bootstrap that binds them to their
//! identifiers, the script itself and the result artifact.

use crate::artifact::{self, ArtifactState, ResultTable};
use crate::binder::Bindings;
use crate::config::LoopConfig;
use crate::error::{CityQueryError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Prefix of the stderr line carrying `str(exception)`
pub const EXCEPTION_MARKER: &str = "__CITYQUERY_EXCEPTION__";

const DATASETS_DIR: &str = "datasets";
const SCRIPT_FILE: &str = "script.py";
const BOOTSTRAP_FILE: &str = "bootstrap.py";
const BINDINGS_FILE: &str = "bindings.json";

const BOOTSTRAP: &str = r#"import json
import os
import sys
import traceback

import pandas as pd
import geopandas as gpd
import numpy as np
from shapely.geometry import Point
from shapely import wkt

MARKER = "__CITYQUERY_EXCEPTION__"
GEOMETRY_COLUMNS = ("geometry", "geometry_wkt")


def load(path):
    frame = pd.read_csv(path)
    for column in frame.columns:
        if str(column).lower() in GEOMETRY_COLUMNS:
            shapes = frame[column].apply(lambda v: wkt.loads(v) if isinstance(v, str) and v.strip() else None)
            frame = frame.drop(columns=[column])
            return gpd.GeoDataFrame(frame, geometry=shapes, crs="EPSG:4326")
    return frame


def main():
    script_path, bindings_path = sys.argv[1], sys.argv[2]
    with open(bindings_path) as handle:
        bindings = json.load(handle)

    namespace = {
        "__name__": "__main__",
        "pd": pd,
        "gpd": gpd,
        "np": np,
        "os": os,
        "Point": Point,
        "wkt": wkt,
    }
    for identifier, path in bindings.items():
        namespace[identifier] = load(path)

    with open(script_path) as handle:
        source = handle.read()

    try:
        exec(compile(source, "script.py", "exec"), namespace)
    except Exception as exc:
        sys.stdout.flush()
        sys.stderr.write(MARKER + " " + " ".join(str(exc).splitlines()) + "\n")
        traceback.print_exc()
        sys.exit(1)


main()
"#;

/// What one execution produced. Only `SuccessWithRows` ends the loop
/// successfully.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    SuccessWithRows(ResultTable),
    SuccessEmpty,
    NoArtifact,
    RuntimeFailure(String),
    MalformedArtifact(String),
}

impl ExecutionOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            ExecutionOutcome::SuccessWithRows(_) => "success_with_rows",
            ExecutionOutcome::SuccessEmpty => "success_empty",
            ExecutionOutcome::NoArtifact => "no_artifact",
            ExecutionOutcome::RuntimeFailure(_) => "runtime_failure",
            ExecutionOutcome::MalformedArtifact(_) => "malformed_artifact",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::SuccessWithRows(_))
    }

    /// The script ran but produced nothing usable
    pub fn is_empty_class(&self) -> bool {
        matches!(self, ExecutionOutcome::SuccessEmpty | ExecutionOutcome::NoArtifact)
    }

    pub fn row_count(&self) -> usize {
        match self {
            ExecutionOutcome::SuccessWithRows(table) => table.len(),
            _ => 0,
        }
    }

    /// Failure text carried by the outcome itself
    pub fn message(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::RuntimeFailure(msg) | ExecutionOutcome::MalformedArtifact(msg) => {
                Some(msg.as_str())
            }
            _ => None,
        }
    }
}

/// Everything captured from one execution
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub stdout: String,
    pub stderr: String,
    /// `str(exception)` when the script raised
    pub exception: Option<String>,
    pub duration: Duration,
}

impl ExecutionReport {
    /// Report for an attempt that never reached the interpreter
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::RuntimeFailure(message.into()),
            stdout: String::new(),
            stderr: String::new(),
            exception: None,
            duration: Duration::ZERO,
        }
    }

    /// Captured stdout followed by the exception text, if any
    pub fn diagnostics(&self) -> String {
        match &self.exception {
            Some(exception) if !self.stdout.is_empty() => format!("{}\n{}", self.stdout, exception),
            Some(exception) => exception.clone(),
            None => self.stdout.clone(),
        }
    }

    /// The error text a hard-error repair should quote
    pub fn error_message(&self) -> String {
        self.outcome
            .message()
            .map(|m| m.to_string())
            .or_else(|| self.exception.clone())
            .unwrap_or_default()
    }
}

/// Executes scripts against bound datasets
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Make the bound datasets available to later runs
    async fn prepare(&self, bindings: &Bindings<'_>) -> Result<()>;

    /// Run one script and inspect what it left behind
    async fn run(&self, script: &str) -> Result<ExecutionReport>;
}

/// Interpreter-process sandbox
#[derive(Debug, Clone)]
pub struct PythonSandbox {
    interpreter: String,
    workspace: PathBuf,
    artifact_name: String,
    timeout: Duration,
}

impl PythonSandbox {
    pub fn new(config: &LoopConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            workspace: config.workspace.clone(),
            artifact_name: config.artifact_name.clone(),
            timeout: config.attempt_timeout(),
        }
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.workspace.join(&self.artifact_name)
    }

    async fn clear_artifact(&self) -> Result<()> {
        let path = self.artifact_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed stale artifact {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn judge(
        &self,
        success: bool,
        exception: Option<&str>,
        stderr: &str,
        code: Option<i32>,
    ) -> Result<ExecutionOutcome> {
        let outcome = match artifact::inspect(&self.artifact_path())? {
            ArtifactState::Table(table) if !table.is_empty() => ExecutionOutcome::SuccessWithRows(table),
            ArtifactState::Table(_) => ExecutionOutcome::SuccessEmpty,
            ArtifactState::Malformed(reason) => ExecutionOutcome::MalformedArtifact(reason),
            ArtifactState::Missing if success && exception.is_none() => ExecutionOutcome::NoArtifact,
            ArtifactState::Missing => {
                let message = exception
                    .map(|e| e.to_string())
                    .or_else(|| last_line(stderr))
                    .unwrap_or_else(|| match code {
                        Some(code) => format!("interpreter exited with status {}", code),
                        None => "interpreter terminated by signal".to_string(),
                    });
                ExecutionOutcome::RuntimeFailure(message)
            }
        };
        Ok(outcome)
    }
}

#[async_trait]
impl ScriptRunner for PythonSandbox {
    async fn prepare(&self, bindings: &Bindings<'_>) -> Result<()> {
        let datasets_dir = self.workspace.join(DATASETS_DIR);
        tokio::fs::create_dir_all(&datasets_dir).await?;

        let mut paths: BTreeMap<&str, String> = BTreeMap::new();
        for binding in bindings.iter() {
            let file_name = format!("{}.csv", binding.identifier);
            binding.dataset.content.write_csv(&datasets_dir.join(&file_name))?;
            paths.insert(binding.identifier, format!("{}/{}", DATASETS_DIR, file_name));
        }

        tokio::fs::write(self.workspace.join(BINDINGS_FILE), serde_json::to_string_pretty(&paths)?).await?;
        tokio::fs::write(self.workspace.join(BOOTSTRAP_FILE), BOOTSTRAP).await?;

        debug!(
            "Prepared sandbox workspace {} with {} dataset(s)",
            self.workspace.display(),
            paths.len()
        );
        Ok(())
    }

    async fn run(&self, script: &str) -> Result<ExecutionReport> {
        self.clear_artifact().await?;
        tokio::fs::write(self.workspace.join(SCRIPT_FILE), script).await?;

        let started = Instant::now();
        let child = Command::new(&self.interpreter)
            .arg(BOOTSTRAP_FILE)
            .arg(SCRIPT_FILE)
            .arg(BINDINGS_FILE)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CityQueryError::Sandbox(format!("failed to start '{}': {}", self.interpreter, e)))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                let mut report = ExecutionReport::failed(format!(
                    "execution timed out after {}s",
                    self.timeout.as_secs()
                ));
                report.duration = started.elapsed();
                return Ok(report);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exception = extract_exception(&stderr);
        let outcome = self.judge(
            output.status.success(),
            exception.as_deref(),
            &stderr,
            output.status.code(),
        )?;

        Ok(ExecutionReport {
            outcome,
            stdout,
            stderr,
            exception,
            duration: started.elapsed(),
        })
    }
}

/// Exception text from the marker line, if the script raised
pub fn extract_exception(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .find_map(|line| line.strip_prefix(EXCEPTION_MARKER))
        .map(|rest| rest.trim().to_string())
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| l.to_string())
}
