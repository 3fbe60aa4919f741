use async_trait::async_trait;
use cityquery::artifact::{ResultRow, ResultTable};
use cityquery::binder::Bindings;
use cityquery::classifier::{DistanceSide, FailureCategory};
use cityquery::controller::{ProgressEvent, RetryController, RunStatus, TerminalState};
use cityquery::dataset::{DatasetTable, Location, TableContent};
use cityquery::llm::{CompletionRequest, CompletionService};
use cityquery::sandbox::{ExecutionOutcome, ExecutionReport, ScriptRunner};
use cityquery::{CityQueryError, LoopConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Hands out canned completions and remembers every request
struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    fn new(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(|s| s.to_string()).map_err(|e| e.to_string()))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> cityquery::Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(e)) => Err(CityQueryError::Llm(e)),
            None => Ok("```python\nresult = near.to_csv('results.csv', index=False)\n```".to_string()),
        }
    }
}

/// Returns canned reports in order, repeating the last one
struct ScriptedRunner {
    reports: Mutex<VecDeque<ExecutionReport>>,
    last: Mutex<Option<ExecutionReport>>,
    scripts: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new(reports: Vec<ExecutionReport>) -> Arc<Self> {
        Arc::new(Self {
            reports: Mutex::new(reports.into_iter().collect()),
            last: Mutex::new(None),
            scripts: Mutex::new(Vec::new()),
        })
    }

    fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptRunner for ScriptedRunner {
    async fn prepare(&self, _bindings: &Bindings<'_>) -> cityquery::Result<()> {
        Ok(())
    }

    async fn run(&self, script: &str) -> cityquery::Result<ExecutionReport> {
        self.scripts.lock().unwrap().push(script.to_string());
        let next = self.reports.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(report) = next {
            *last = Some(report);
        }
        Ok(last.clone().unwrap_or_else(|| report(ExecutionOutcome::SuccessEmpty, "")))
    }
}

fn report(outcome: ExecutionOutcome, stdout: &str) -> ExecutionReport {
    let exception = match &outcome {
        ExecutionOutcome::RuntimeFailure(msg) => Some(msg.clone()),
        _ => None,
    };
    ExecutionReport {
        outcome,
        stdout: stdout.to_string(),
        stderr: String::new(),
        exception,
        duration: Duration::from_millis(5),
    }
}

fn rows() -> ExecutionOutcome {
    ExecutionOutcome::SuccessWithRows(ResultTable {
        rows: vec![ResultRow {
            name: "Carrer de la Maquinista 12".to_string(),
            longitude: 2.1893,
            latitude: 41.3812,
        }],
    })
}

fn datasets() -> DatasetTable {
    let mut datasets = DatasetTable::new();
    let buildings = TableContent::new(
        vec!["name".to_string(), "geometry".to_string()],
        vec![
            vec!["Carrer de la Maquinista 12".to_string(), "POINT (2.1893 41.3812)".to_string()],
            vec!["Passeig de Joan de Borbó 5".to_string(), "POINT (2.1887 41.3797)".to_string()],
        ],
    )
    .unwrap();
    datasets
        .insert("Residential Building Locations", buildings, "Residential buildings in Ciutat Vella")
        .unwrap();
    datasets
        .insert("Emission Zones", TableContent::default(), "Low emission zones")
        .unwrap();
    datasets
}

fn locations() -> Vec<Location> {
    vec![Location {
        name: "Barceloneta".to_string(),
        lat: 41.3809,
        lon: 2.191,
    }]
}

const QUESTION: &str = "Which residential buildings near Barceloneta are inside a low emission zone?";

#[tokio::test]
async fn test_first_attempt_success() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![Ok(
        "Here you go:\n```python\nresult=buildings\nresult.to_csv('results.csv', index=False)\n```",
    )]);
    let runner = ScriptedRunner::new(vec![report(rows(), "1 row")]);
    let controller = RetryController::new(completion.clone(), runner.clone(), LoopConfig::default());

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::Succeeded);
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.row_count, 1);
    assert_eq!(report.rows.rows[0].name, "Carrer de la Maquinista 12");
    assert!(report.last_error.is_none());

    // only the generation prompt was sent
    let requests = completion.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].user.contains("residential_building_locations"));
    assert!(requests[0].user.contains("Barceloneta: lat=41.3809, lon=2.191"));

    // the runner got the sanitized script
    let scripts = runner.scripts();
    assert!(scripts[0].starts_with("import pandas as pd\n"));
    assert!(scripts[0].contains("result = buildings"));
    assert!(!scripts[0].contains("```"));
    assert_eq!(report.final_script, scripts[0]);
    assert_eq!(report.trace[0].original_text.lines().next(), Some("Here you go:"));
    assert!(report.trace[0].categories.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_empty_result_is_repaired() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![
        Ok("near = buildings[d < 0.001]\nnear.to_csv('results.csv', index=False)"),
        Ok("near = buildings[d < 0.1]\nnear.to_csv('results.csv', index=False)"),
    ]);
    let runner = ScriptedRunner::new(vec![
        report(ExecutionOutcome::SuccessEmpty, "Buildings: 2\nNo buildings found near location"),
        report(rows(), ""),
    ]);
    let controller = RetryController::new(completion.clone(), runner.clone(), LoopConfig::default());

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::Succeeded);
    assert_eq!(report.attempts, 2);
    assert_eq!(
        report.trace[0].categories[0],
        FailureCategory::DistanceTooSmall(DistanceSide::Buildings)
    );
    assert_eq!(report.trace[0].outcome, "success_empty");

    let requests = completion.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].user.contains("EMPTY RESULTS"));
    assert!(requests[1].user.contains("near = buildings[d < 0.001]"));
    assert!(requests[1].user.contains("No buildings found near location"));
    assert!(!requests[1].user.contains("ORIGINAL USER QUESTION: \"\""));

    let scripts = runner.scripts();
    assert_eq!(scripts.len(), 2);
    assert!(scripts[1].contains("d < 0.1"));
    Ok(())
}

#[tokio::test]
async fn test_empty_budget_exhausted() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![]);
    let runner = ScriptedRunner::new(vec![report(ExecutionOutcome::SuccessEmpty, "0 rows")]);
    let config = LoopConfig::default();
    let max_empty = config.max_empty_result_retries;
    let controller = RetryController::new(completion.clone(), runner.clone(), config);

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::ExhaustedEmpty);
    assert_eq!(report.status, RunStatus::Warning);
    assert_eq!(report.attempts, max_empty + 1);
    assert_eq!(report.row_count, 0);
    assert!(report.rows.is_empty());
    assert_eq!(report.trace.len(), (max_empty + 1) as usize);
    assert!(matches!(
        report.trace[0].categories[0],
        FailureCategory::EmptyResultGeneric { .. }
    ));
    assert_eq!(completion.requests().len(), (max_empty + 1) as usize);
    Ok(())
}

#[tokio::test]
async fn test_missing_output_exhaustion_is_error() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![]);
    let runner = ScriptedRunner::new(vec![report(ExecutionOutcome::NoArtifact, "")]);
    let config = LoopConfig {
        max_empty_result_retries: 1,
        ..LoopConfig::default()
    };
    let controller = RetryController::new(completion, runner, config);

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::ExhaustedEmpty);
    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.trace[0].categories[0], FailureCategory::MissingOutputFile);
    Ok(())
}

#[tokio::test]
async fn test_hard_error_budget_bounds_attempts() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![]);
    let runner = ScriptedRunner::new(vec![report(
        ExecutionOutcome::RuntimeFailure("invalid syntax (script.py, line 6)".to_string()),
        "",
    )]);
    let config = LoopConfig::default();
    let max_hard = config.max_hard_error_retries;
    let controller = RetryController::new(completion.clone(), runner.clone(), config);

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::ExhaustedError);
    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(report.attempts, max_hard + 1);
    assert!(report.message.contains("invalid syntax"));
    assert_eq!(report.last_error.as_deref(), Some("invalid syntax (script.py, line 6)"));

    let requests = completion.requests();
    assert_eq!(requests.len(), (max_hard + 1) as usize);
    for repair in &requests[1..] {
        assert!(repair.user.contains("FAILED CODE:"));
        assert!(repair.user.contains("Replace \"= =\" with \"==\""));
        // repairs never carry earlier prompts
        assert!(!repair.user.contains("Generate ONLY Python code."));
    }
    Ok(())
}

#[tokio::test]
async fn test_upstream_failure_counts_against_hard_budget() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![
        Err("connection refused"),
        Ok("result = buildings\nresult.to_csv('results.csv', index=False)"),
    ]);
    let runner = ScriptedRunner::new(vec![report(rows(), "")]);
    let controller = RetryController::new(completion.clone(), runner.clone(), LoopConfig::default());

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::Succeeded);
    assert_eq!(report.attempts, 2);
    assert_eq!(report.trace[0].outcome, "runtime_failure");
    assert!(report.trace[0].script.is_empty());
    assert!(matches!(
        &report.trace[0].categories[0],
        FailureCategory::UpstreamUnavailable(msg) if msg.contains("connection refused")
    ));

    // no script existed yet, so the retry asks for generation again
    let requests = completion.requests();
    assert_eq!(requests[1], requests[0]);
    assert_eq!(runner.scripts().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_upstream_never_recovers() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![Err("503"); 10]);
    let runner = ScriptedRunner::new(vec![]);
    let config = LoopConfig {
        max_hard_error_retries: 2,
        ..LoopConfig::default()
    };
    let controller = RetryController::new(completion, runner.clone(), config);

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::ExhaustedError);
    assert_eq!(report.attempts, 3);
    assert!(report.final_script.is_empty());
    assert!(runner.scripts().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_upstream_failure_during_empty_repair_resends_it() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![
        Ok("near = buildings[d < 0.001]\nnear.to_csv('results.csv', index=False)"),
        Err("503 Service Unavailable"),
        Ok("near = buildings[d < 0.1]\nnear.to_csv('results.csv', index=False)"),
    ]);
    let runner = ScriptedRunner::new(vec![
        report(ExecutionOutcome::SuccessEmpty, "No buildings found near location"),
        report(rows(), ""),
    ]);
    let controller = RetryController::new(completion.clone(), runner.clone(), LoopConfig::default());

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::Succeeded);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.trace[1].outcome, "runtime_failure");

    let requests = completion.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].user.contains("EMPTY RESULTS"));
    assert_eq!(requests[2], requests[1]);
    assert!(requests[2].user.contains("For distance-too-small:"));
    assert!(!requests[2].user.contains("503 Service Unavailable"));
    assert_eq!(runner.scripts().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_huge_runtime_error_keeps_repair_bounded() -> Result<(), Box<dyn std::error::Error>> {
    let error = "E".repeat(50_000);
    let completion = ScriptedCompletion::new(vec![]);
    let runner = ScriptedRunner::new(vec![
        report(ExecutionOutcome::RuntimeFailure(error.clone()), ""),
        report(rows(), ""),
    ]);
    let config = LoopConfig {
        max_hard_error_retries: 1,
        ..LoopConfig::default()
    };
    let controller = RetryController::new(completion.clone(), runner, config);

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::Succeeded);
    let requests = completion.requests();
    assert!(requests[1].user.contains("For execution-error:"));
    assert!(!requests[1].user.contains(&"E".repeat(1001)));
    assert!(requests[1].user.len() < 10_000, "repair prompt grew to {} chars", requests[1].user.len());
    Ok(())
}

#[tokio::test]
async fn test_identifier_collision_is_rejected_before_any_attempt() {
    let mut datasets = DatasetTable::new();
    datasets.insert("Emission Zones", TableContent::default(), "").unwrap();
    datasets.insert("emission-zones", TableContent::default(), "").unwrap();

    let completion = ScriptedCompletion::new(vec![]);
    let runner = ScriptedRunner::new(vec![]);
    let controller = RetryController::new(completion.clone(), runner, LoopConfig::default());

    let result = controller.run(QUESTION, &datasets, &[]).await;

    assert!(matches!(result, Err(CityQueryError::Binding(_))));
    assert!(completion.requests().is_empty());
}

#[tokio::test]
async fn test_repeated_failure_aborts_when_enabled() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![]);
    let runner = ScriptedRunner::new(vec![report(
        ExecutionOutcome::RuntimeFailure("expected an indented block (script.py, line 4)".to_string()),
        "",
    )]);
    let config = LoopConfig {
        abort_on_repeat_failure: true,
        ..LoopConfig::default()
    };
    let controller = RetryController::new(completion, runner, config);

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;

    assert_eq!(report.state, TerminalState::ExhaustedError);
    assert_eq!(report.attempts, 2);
    assert!(report.message.contains("stopped early"));
    Ok(())
}

#[tokio::test]
async fn test_progress_events_in_order() -> Result<(), Box<dyn std::error::Error>> {
    let completion = ScriptedCompletion::new(vec![]);
    let runner = ScriptedRunner::new(vec![report(ExecutionOutcome::SuccessEmpty, ""), report(rows(), "")]);
    let (tx, mut rx) = mpsc::channel(16);
    let controller =
        RetryController::new(completion, runner, LoopConfig::default()).with_progress(tx);

    let report = controller.run(QUESTION, &datasets(), &locations()).await?;
    drop(controller);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            ProgressEvent::AttemptStarted { attempt: 1 },
            ProgressEvent::AttemptFinished {
                attempt: 1,
                outcome: "success_empty".to_string(),
                row_count: 0
            },
            ProgressEvent::Repairing {
                attempt: 2,
                categories: vec!["empty-result-generic".to_string()]
            },
            ProgressEvent::AttemptStarted { attempt: 2 },
            ProgressEvent::AttemptFinished {
                attempt: 2,
                outcome: "success_with_rows".to_string(),
                row_count: 1
            },
            ProgressEvent::Finished {
                state: TerminalState::Succeeded,
                attempts: 2
            },
        ]
    );
    assert_eq!(report.attempts, 2);
    Ok(())
}
