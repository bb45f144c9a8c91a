use crate::{
    env::EnvManager,
    error::CliError,
    shutdown::{ExitCode, StopSignals},
};
use chrono::Utc;
use clap::Parser;
use commands::Commands;
use engine_config::settings::OrchestratorSettings;
use engine_core::state::{JobStore, sled_store::SledJobStore};
use engine_runtime::orchestrator::{JobView, Orchestrator};
use model::{
    job::{JobDefinition, JobRecord, JobStatus},
    ledger::LedgerSnapshot,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod env;
mod error;
mod shutdown;

#[derive(Parser)]
#[command(name = "jobctl", version, about = "Partitioned and cursor job orchestrator")]
struct Cli {
    #[arg(
        long,
        global = true,
        help = "Extra .env file with JOBS_* settings (./.env is read when present)"
    )]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let signals = StopSignals::install();

    let code = match run(cli, &signals).await {
        Ok(code) => code,
        Err(CliError::ShutdownRequested) => signals
            .received()
            .map(|signal| signal.exit_code())
            .unwrap_or(ExitCode::Interrupted),
        Err(e) => {
            error!(error = %e, "jobctl failed");
            ExitCode::GeneralError
        }
    };
    std::process::exit(code.as_i32());
}

async fn run(cli: Cli, signals: &StopSignals) -> Result<ExitCode, CliError> {
    let settings = load_settings(cli.env_file.as_deref())?;
    let store = open_job_store(&settings)?;
    let orchestrator = Orchestrator::from_settings(store, settings)?;

    match cli.command {
        Commands::Create { definition } => {
            let source = tokio::fs::read_to_string(&definition).await?;
            let def: JobDefinition = serde_json::from_str(&source)?;
            let job = orchestrator.create(def).await?;
            println!("{}", job.id);
        }
        Commands::Start { job_id } => {
            orchestrator.start(&job_id).await?;
            return drive(&orchestrator, &job_id, signals).await;
        }
        Commands::Resume { job_id } => {
            let outcome = orchestrator.resume(&job_id).await?;
            info!(job_id = %job_id, outcome = ?outcome, "Resume accepted");
            return drive(&orchestrator, &job_id, signals).await;
        }
        Commands::Stop { job_id } => {
            let job = orchestrator.stop(&job_id).await?;
            println!("{}: {}", job.id, job.status);
        }
        Commands::Reset { job_id } => {
            let job = orchestrator.reset(&job_id).await?;
            println!("{}: {}", job.id, job.status);
        }
        Commands::Status { job_id, json } => {
            let view = orchestrator.status(&job_id).await?;
            if json {
                let out = serde_json::to_string_pretty(&view).map_err(CliError::JsonSerialize)?;
                println!("{out}");
            } else {
                print_status_table(&view);
            }
        }
        Commands::List { due, json } => {
            let mut views = orchestrator.list().await?;
            if due {
                let now = Utc::now();
                views.retain(|view| view.record.is_due(now));
            }
            if json {
                let out = serde_json::to_string_pretty(&views).map_err(CliError::JsonSerialize)?;
                println!("{out}");
            } else {
                print_job_list(&views);
            }
        }
    }

    Ok(ExitCode::Success)
}

fn load_settings(env_file: Option<&Path>) -> Result<OrchestratorSettings, CliError> {
    let mut env = EnvManager::new();
    let local = Path::new(".env");
    if local.is_file() {
        env.load_from_file(local)?;
    }
    if let Some(path) = env_file {
        env.load_from_file(path)?;
    }

    for (key, value) in env.redacted_settings() {
        debug!(key = %key, value = %value, "Setting from environment");
    }
    Ok(OrchestratorSettings::from_vars(&env.settings_vars())?)
}

fn open_job_store(settings: &OrchestratorSettings) -> Result<Arc<dyn JobStore>, CliError> {
    let path = match &settings.state_dir {
        Some(dir) => dir.clone(),
        None => dirs::home_dir()
            .ok_or_else(|| CliError::Config("Could not determine home directory".into()))?
            .join(".jobctl/state"),
    };
    let store = SledJobStore::open(&path)
        .map_err(|err| CliError::StateStore(format!("{}: {err}", path.display())))?;
    Ok(Arc::new(store))
}

/// Keeps the process alive while the run is attached, logging progress.
/// A stop signal turns into a cooperative stop and waits for the run to settle.
async fn drive(
    orchestrator: &Orchestrator,
    job_id: &str,
    signals: &StopSignals,
) -> Result<ExitCode, CliError> {
    let cancel = signals.token();
    let mut progress = orchestrator.subscribe(job_id).await;
    let wait = orchestrator.wait(job_id);
    tokio::pin!(wait);

    loop {
        tokio::select! {
            job = &mut wait => {
                let job = job?;
                print_summary(&job);
                return Ok(match job.status {
                    JobStatus::Failed => ExitCode::JobFailed,
                    _ => ExitCode::Success,
                });
            }
            _ = cancel.cancelled() => break,
            Some(snapshot) = next_progress(&mut progress) => {
                info!(
                    job_id,
                    completed = snapshot.completed,
                    failed = snapshot.failed,
                    remaining = snapshot.remaining,
                    items_processed = snapshot.items_processed,
                    "Progress"
                );
            }
        }
    }

    warn!(job_id, signal = ?signals.received(), "Stopping job before exit");
    orchestrator.stop(job_id).await?;
    let job = orchestrator.wait(job_id).await?;
    print_summary(&job);
    Err(CliError::ShutdownRequested)
}

async fn next_progress(
    rx: &mut Option<watch::Receiver<LedgerSnapshot>>,
) -> Option<LedgerSnapshot> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    match receiver.changed().await {
        Ok(()) => Some(*receiver.borrow_and_update()),
        Err(_) => {
            *rx = None;
            None
        }
    }
}

fn print_summary(job: &JobRecord) {
    println!("Job '{}' is {}", job.id, job.status);
    println!("{:<18} {}", "Processed", job.totals_processed);
    if let Some(note) = &job.note {
        println!("{:<18} {}", "Note", note);
    }
    if let Some(err) = &job.last_error {
        println!("{:<18} {}", "Error", err);
    }
    if job.status == JobStatus::Running {
        println!("No controller is attached anymore; run `jobctl resume {}` to continue.", job.id);
    }
}

fn print_status_table(view: &JobView) {
    let job = &view.record;
    println!("Job '{}' ({})", job.id, job.name);
    println!("-----------------------------");
    println!("{:<18} {}", "Kind", job.kind);
    println!("{:<18} {}", "Condition", view.condition);
    println!(
        "{:<18} {}/{} done, {} failed, {} remaining",
        "Units", view.progress.completed, view.progress.total, view.progress.failed,
        view.progress.remaining
    );
    println!("{:<18} {}", "Processed", job.totals_processed);
    if let Some(checkpoint) = &job.checkpoint {
        let cursor = checkpoint
            .cursor
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "start".to_string());
        println!("{:<18} {} ({} batches)", "Cursor", cursor, checkpoint.batches);
    }
    let started = job
        .started_at
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| "n/a".to_string());
    println!("{:<18} {}", "Started", started);
    if let Some(ms) = job.last_duration_ms {
        println!("{:<18} {ms} ms", "Duration");
    }
    if let Some(note) = &job.note {
        println!("{:<18} {}", "Note", note);
    }
    if let Some(err) = &job.last_error {
        println!("{:<18} {}", "Last error", err);
    }
}

fn print_job_list(views: &[JobView]) {
    println!("{:<24} {:<12} {:<20} {:>12}", "ID", "KIND", "CONDITION", "PROCESSED");
    for view in views {
        println!(
            "{:<24} {:<12} {:<20} {:>12}",
            view.record.id,
            view.record.kind.as_str(),
            view.condition.as_str(),
            view.record.totals_processed
        );
    }
}
