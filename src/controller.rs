//! Retry Controller
//!
//! One state machine for the whole generate-execute-repair loop. Crashes and
//! empty results are repaired with different prompts and count against
//! separate budgets; the attempt counter is shared.

use crate::artifact::ResultTable;
use crate::binder::Bindings;
use crate::classifier::{FailureCategory, FailureClassifier};
use crate::config::LoopConfig;
use crate::dataset::{DatasetTable, Location};
use crate::error::Result;
use crate::llm::{CompletionRequest, CompletionService};
use crate::prompts::{PromptContext, RepairPromptBuilder};
use crate::sandbox::{ExecutionOutcome, ExecutionReport, ScriptRunner};
use crate::sanitizer::{CodeSanitizer, SanitizedScript};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalState {
    Succeeded,
    ExhaustedEmpty,
    ExhaustedError,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalState::Succeeded => write!(f, "succeeded"),
            TerminalState::ExhaustedEmpty => write!(f, "exhausted_empty"),
            TerminalState::ExhaustedError => write!(f, "exhausted_error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Warning,
    Error,
}

/// One entry of the attempt trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// Sanitized script that ran; empty when no script arrived
    pub script: String,
    /// Model output before sanitizing
    pub original_text: String,
    pub outcome: String,
    pub row_count: usize,
    pub diagnostic: String,
    pub categories: Vec<FailureCategory>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Progress notifications, in production order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    AttemptStarted { attempt: u32 },
    AttemptFinished { attempt: u32, outcome: String, row_count: usize },
    Repairing { attempt: u32, categories: Vec<String> },
    Finished { state: TerminalState, attempts: u32 },
}

/// Terminal record of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub state: TerminalState,
    pub message: String,
    pub attempts: u32,
    pub final_script: String,
    pub row_count: usize,
    pub rows: ResultTable,
    pub last_error: Option<String>,
    pub trace: Vec<AttemptRecord>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == TerminalState::Succeeded
    }
}

/// Drives generate, execute, classify and repair until success or exhaustion
pub struct RetryController {
    completion: Arc<dyn CompletionService>,
    runner: Arc<dyn ScriptRunner>,
    config: LoopConfig,
    sanitizer: CodeSanitizer,
    classifier: FailureClassifier,
    prompts: RepairPromptBuilder,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl RetryController {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        runner: Arc<dyn ScriptRunner>,
        config: LoopConfig,
    ) -> Self {
        let prompts = RepairPromptBuilder::new(config.artifact_name.clone());
        Self {
            completion,
            runner,
            config,
            sanitizer: CodeSanitizer::new(),
            classifier: FailureClassifier::new(),
            prompts,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Answer `question` from `datasets`.
    ///
    /// Only setup problems (identifier collisions, an unwritable workspace)
    /// are returned as `Err`; every per-attempt failure ends up in the report.
    pub async fn run(
        &self,
        question: &str,
        datasets: &DatasetTable,
        locations: &[Location],
    ) -> Result<RunReport> {
        let bindings = Bindings::bind(datasets)?;
        self.runner.prepare(&bindings).await?;

        let ctx = PromptContext {
            question,
            bindings: &bindings,
            locations,
        };
        let run_id = Uuid::new_v4();
        let max_attempts = self.config.max_attempts();
        info!(
            "Run {}: {} dataset(s) bound as [{}]",
            run_id,
            bindings.len(),
            bindings.identifiers().join(", ")
        );

        let mut trace: Vec<AttemptRecord> = Vec::new();
        let mut current: Option<SanitizedScript> = None;
        let mut request = self.prompts.generation_request(&ctx);
        let mut previous_categories: Option<Vec<FailureCategory>> = None;
        let mut attempt: u32 = 1;

        loop {
            info!("Execution attempt {} of at most {}", attempt, max_attempts);
            self.emit(ProgressEvent::AttemptStarted { attempt }).await;
            let started_at = Utc::now();

            let (report, categories, fresh) = match self.completion.complete(&request).await {
                Ok(raw) => {
                    let script = self.sanitizer.sanitize(&raw);
                    debug!("Sanitized script for attempt {}:\n{}", attempt, script.text);
                    let report = match self.runner.run(&script.text).await {
                        Ok(report) => report,
                        Err(e) => ExecutionReport::failed(e.to_string()),
                    };
                    let categories = self.classifier.classify(&report, datasets);
                    current = Some(script);
                    (report, categories, true)
                }
                Err(e) => {
                    let message = format!("completion service unavailable: {}", e);
                    warn!("Attempt {}: {}", attempt, message);
                    let categories = self.classifier.classify_upstream(&message);
                    (ExecutionReport::failed(message), categories, false)
                }
            };

            let outcome = &report.outcome;
            let (script_text, original_text) = match (&current, fresh) {
                (Some(script), true) => (script.text.clone(), script.original.clone()),
                _ => (String::new(), String::new()),
            };
            trace.push(AttemptRecord {
                attempt,
                script: script_text,
                original_text,
                outcome: outcome.tag().to_string(),
                row_count: outcome.row_count(),
                diagnostic: report.diagnostics(),
                categories: categories.clone(),
                started_at,
                finished_at: Utc::now(),
            });
            self.emit(ProgressEvent::AttemptFinished {
                attempt,
                outcome: outcome.tag().to_string(),
                row_count: outcome.row_count(),
            })
            .await;

            if let ExecutionOutcome::SuccessWithRows(table) = outcome {
                info!("✅ Script succeeded on attempt {} with {} rows", attempt, table.len());
                return Ok(self
                    .finish(run_id, TerminalState::Succeeded, attempt, &current, &report, trace, false)
                    .await);
            }

            let empty_path = outcome.is_empty_class();
            let (budget, exhausted) = if empty_path {
                (self.config.max_empty_result_retries, TerminalState::ExhaustedEmpty)
            } else {
                (self.config.max_hard_error_retries, TerminalState::ExhaustedError)
            };

            let tags: Vec<String> = categories.iter().map(|c| c.tag().to_string()).collect();
            warn!(
                "Attempt {} ended with {} [{}]",
                attempt,
                outcome.tag(),
                tags.join(", ")
            );

            if attempt > budget {
                warn!("Retry budget of {} exhausted after {} attempts", budget, attempt);
                return Ok(self
                    .finish(run_id, exhausted, attempt, &current, &report, trace, false)
                    .await);
            }
            if self.should_abort(&categories, &previous_categories) {
                warn!("Attempt {} repeated the previous failure, stopping", attempt);
                return Ok(self
                    .finish(run_id, exhausted, attempt, &current, &report, trace, true)
                    .await);
            }

            // a failed completion re-sends the pending request unchanged
            if let (true, Some(script)) = (fresh, &current) {
                request = self.next_request(&ctx, script, &report, &categories, empty_path);
            }
            self.emit(ProgressEvent::Repairing {
                attempt: attempt + 1,
                categories: tags,
            })
            .await;

            previous_categories = Some(categories);
            attempt += 1;
        }
    }

    fn next_request(
        &self,
        ctx: &PromptContext<'_>,
        script: &SanitizedScript,
        report: &ExecutionReport,
        categories: &[FailureCategory],
        empty_path: bool,
    ) -> CompletionRequest {
        let diagnostics = report.diagnostics();
        if empty_path {
            self.prompts
                .empty_result_request(ctx, &script.text, categories, &diagnostics)
        } else {
            self.prompts.hard_error_request(
                ctx,
                &script.text,
                categories,
                &report.error_message(),
                &diagnostics,
            )
        }
    }

    /// Check if we should abort due to a repeated failure
    fn should_abort(
        &self,
        current: &[FailureCategory],
        previous: &Option<Vec<FailureCategory>>,
    ) -> bool {
        if !self.config.abort_on_repeat_failure {
            return false;
        }
        match previous {
            Some(prev) => prev.as_slice() == current,
            None => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        run_id: Uuid,
        state: TerminalState,
        attempts: u32,
        current: &Option<SanitizedScript>,
        report: &ExecutionReport,
        trace: Vec<AttemptRecord>,
        stopped_early: bool,
    ) -> RunReport {
        let rows = match &report.outcome {
            ExecutionOutcome::SuccessWithRows(table) => table.clone(),
            _ => ResultTable::default(),
        };

        let (status, mut message) = match (state, &report.outcome) {
            (TerminalState::Succeeded, _) => (
                RunStatus::Success,
                format!("Code executed successfully on attempt {}", attempts),
            ),
            (TerminalState::ExhaustedEmpty, ExecutionOutcome::NoArtifact) => (
                RunStatus::Error,
                format!("No output file created after {} attempts", attempts),
            ),
            (TerminalState::ExhaustedEmpty, _) => (
                RunStatus::Warning,
                format!(
                    "Analysis completed but no matching data found after {} attempts",
                    attempts
                ),
            ),
            (TerminalState::ExhaustedError, _) => (
                RunStatus::Error,
                format!(
                    "Final error after {} attempts: {}",
                    attempts,
                    report.error_message()
                ),
            ),
        };
        if stopped_early {
            message.push_str(" (stopped early: same failure twice in a row)");
        }

        let last_error = if state == TerminalState::Succeeded {
            None
        } else {
            let error = report.error_message();
            let text = if error.is_empty() { report.diagnostics() } else { error };
            Some(text).filter(|t| !t.trim().is_empty())
        };

        info!("Run {} finished: {} after {} attempt(s)", run_id, state, attempts);
        self.emit(ProgressEvent::Finished { state, attempts }).await;

        RunReport {
            run_id,
            status,
            state,
            message,
            attempts,
            final_script: current.as_ref().map(|s| s.text.clone()).unwrap_or_default(),
            row_count: rows.len(),
            rows,
            last_error,
            trace,
        }
    }

    async fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            if tx.send(event).await.is_err() {
                debug!("Progress receiver dropped");
            }
        }
    }
}
