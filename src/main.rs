use anyhow::{Context, Result};
use cityquery::controller::{ProgressEvent, RetryController};
use cityquery::llm::LlmClient;
use cityquery::sandbox::PythonSandbox;
use cityquery::{LlmConfig, LoopConfig, Manifest};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cityquery")]
#[command(about = "Answer geospatial questions about a city with generated, self-repairing analysis scripts")]
struct Args {
    /// The question in natural language
    question: String,

    /// JSON manifest listing datasets and target locations
    #[arg(short, long)]
    manifest: PathBuf,

    /// Directory for dataset copies, the script and the result artifact
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Repairs allowed after a crash
    #[arg(long)]
    max_hard_retries: Option<u32>,

    /// Repairs allowed after an empty result
    #[arg(long)]
    max_empty_retries: Option<u32>,

    /// Wall-clock limit per script execution, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Interpreter used to run generated scripts
    #[arg(long)]
    interpreter: Option<String>,

    /// Write the result table to this CSV file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the full run report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = LoopConfig::from_env()?;
    if let Some(workspace) = args.workspace {
        config.workspace = workspace;
    }
    if let Some(n) = args.max_hard_retries {
        config.max_hard_error_retries = n;
    }
    if let Some(n) = args.max_empty_retries {
        config.max_empty_result_retries = n;
    }
    if let Some(secs) = args.timeout_secs {
        config.attempt_timeout_secs = secs;
    }
    if let Some(interpreter) = args.interpreter {
        config.interpreter = interpreter;
    }
    config.validate()?;

    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;
    info!(
        "Loaded {} dataset(s) and {} location(s)",
        manifest.datasets.len(),
        manifest.locations.len()
    );

    let llm = LlmClient::new(&LlmConfig::from_env()?)?;
    info!("Using model {}", llm.model());
    let sandbox = PythonSandbox::new(&config);

    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(32);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::AttemptStarted { attempt } => eprintln!("🚀 Attempt {}", attempt),
                ProgressEvent::AttemptFinished { attempt, outcome, row_count } => {
                    eprintln!("   attempt {} → {} ({} rows)", attempt, outcome, row_count)
                }
                ProgressEvent::Repairing { attempt, categories } => {
                    eprintln!("🔧 Repairing for attempt {}: {}", attempt, categories.join(", "))
                }
                ProgressEvent::Finished { state, attempts } => {
                    eprintln!("🏁 {} after {} attempt(s)", state, attempts)
                }
            }
        }
    });

    let controller = RetryController::new(Arc::new(llm), Arc::new(sandbox), config).with_progress(tx);
    let report = controller
        .run(&args.question, &manifest.datasets, &manifest.locations)
        .await?;
    drop(controller);
    printer.await.ok();

    if let Some(path) = &args.output {
        report.rows.write_csv(path)?;
        info!("Wrote {} row(s) to {}", report.row_count, path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n=== cityquery ===");
        println!("Status:   {:?}", report.status);
        println!("Message:  {}", report.message);
        println!("Attempts: {}", report.attempts);
        println!("Rows:     {}", report.row_count);
        for row in report.rows.rows.iter().take(10) {
            println!("  {} ({}, {})", row.name, row.longitude, row.latitude);
        }
        if let Some(error) = &report.last_error {
            println!("Last error: {}", error);
        }
    }

    Ok(())
}
