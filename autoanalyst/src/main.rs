use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autoanalyst_sdk::{log_info, DatasetHandle, ExecLimits};
use clap::Parser;

use autoanalyst::backend::HttpBackend;
use autoanalyst::config::{EngineConfig, ENV_API_KEY, ENV_BACKEND_MODEL, ENV_BACKEND_URL};
use autoanalyst::interpreter::ResultInterpreter;
use autoanalyst::orchestrator::Orchestrator;
use autoanalyst::sandbox::ExecutionSandbox;
use autoanalyst::state::StateStore;
use autoanalyst::{backend::RetryPolicy, ingest, report};

/// Automated, iterative data analysis over a CSV dataset
#[derive(Parser, Debug)]
#[command(name = "autoanalyst", version)]
struct Args {
    /// Path to the dataset CSV
    #[arg(short, long)]
    data: PathBuf,

    /// Path to the data dictionary (Markdown table or JSON)
    #[arg(long)]
    data_dict: PathBuf,

    /// Output directory for figures, reports and the state database
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Project id; snapshots are keyed by it
    #[arg(short, long, default_value = "default")]
    project: String,

    /// Resume from the latest persisted snapshot when one exists
    #[arg(long)]
    resume: bool,

    /// Maximum number of analyses to run
    #[arg(long)]
    max_analyses: Option<u64>,

    /// Simultaneous analyses (1 = fully sequential)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Reasoning backend endpoint (chat-completions compatible);
    /// overrides AUTOANALYST_BACKEND_URL
    #[arg(long)]
    backend_url: Option<String>,

    /// Model name passed to the backend; overrides AUTOANALYST_BACKEND_MODEL
    #[arg(long)]
    model: Option<String>,

    /// Optional YAML config file with engine tunables
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let mut config = EngineConfig::default();
    if let Some(path) = &args.config {
        config = config.apply_file(path)?;
    }
    config.output_dir = args.output.clone();
    if let Some(max) = args.max_analyses {
        config.max_analyses = max;
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrency = concurrency;
    }
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;

    let backend_url = args
        .backend_url
        .or_else(|| std::env::var(ENV_BACKEND_URL).ok())
        .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
    let model = args
        .model
        .or_else(|| std::env::var(ENV_BACKEND_MODEL).ok())
        .unwrap_or_else(|| "gpt-4o".to_string());
    let api_key = std::env::var(ENV_API_KEY)
        .with_context(|| format!("{} is not set", ENV_API_KEY))?;

    let backend = Arc::new(
        HttpBackend::new(backend_url, model, api_key, Duration::from_secs(120))
            .context("failed to build reasoning backend")?,
    );
    let runner = Arc::new(ExecutionSandbox::new()?);
    let store = StateStore::open(config.db_path())?;
    let dataset = DatasetHandle {
        data_path: args.data.clone(),
        output_dir: config.output_dir.clone(),
    };

    log_info!("Profiling dataset {}", args.data.display());
    let limits = ExecLimits {
        timeout_secs: config.exec_timeout_secs,
        allowed_imports: config.allowed_imports.clone(),
    };
    let profile =
        ingest::build_profile(&args.data_dict, runner.as_ref(), &dataset, &limits).await?;

    let retry = RetryPolicy::new(config.backend_max_retries, config.backend_backoff_ms);
    let interpreter = ResultInterpreter::new(retry, config.context_budget);
    let output_dir = config.output_dir.clone();

    let orchestrator = Orchestrator::new(config, backend.clone(), runner, store, dataset);

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_info!("Cancellation requested; finishing in-flight work");
            cancel.cancel();
        }
    });

    let (state, summary) = orchestrator.run(&args.project, profile, args.resume).await?;

    log_info!(
        "Run {}: {} ({} analyses over {} rounds, {} repairs)",
        args.project,
        summary.reason,
        summary.analyses_run,
        summary.rounds,
        summary.retries_used
    );

    let body = interpreter
        .summary_report(
            backend.as_ref(),
            &state.digest_text(),
            &state.plan_overview(),
        )
        .await;
    report::write_reports(&state, &body, &output_dir).await?;

    Ok(())
}
