//! # chatlog
//!
//! Command-line front end for `chatlog-ingest`.
//!
//! ```bash
//! chatlog ingest ~/Downloads/chat-export.zip
//! chatlog resume
//! chatlog status 2b0c...
//! chatlog threads --date 2024-01-15
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use chatlog_ingest::db::run_repo::{self, RunRow};
use chatlog_ingest::db::{message_repo, thread_repo};
use chatlog_ingest::pipeline::{ProgressEvent, ProgressReporter};
use chatlog_ingest::{
    config, telemetry, Config, Database, Intake, PipelineCoordinator, RunOutcome, WorkerPool,
};

#[derive(Parser)]
#[command(
    name = "chatlog",
    about = "Ingest chat export archives into per-day conversation threads",
    version
)]
struct Cli {
    /// Path to a JSON configuration file. Defaults plus `CHATLOG_*`
    /// environment overrides are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept one or more export archives and run them to completion.
    Ingest {
        #[arg(required = true)]
        archives: Vec<PathBuf>,
    },

    /// Continue an interrupted run, or every unfinished run when no id is given.
    Resume { run_id: Option<String> },

    /// Show the stored state of a run.
    Status { run_id: String },

    /// List the threads of one UTC day, or the days that have threads.
    Threads {
        /// Day as `YYYY-MM-DD`.
        #[arg(long)]
        date: Option<String>,
    },
}

/// Prints coordinator progress as log lines.
struct ConsoleProgress;

impl ProgressReporter for ConsoleProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Stage {
                run_id,
                stage,
                percent,
            } => info!(%run_id, %stage, percent, "Stage started"),
            ProgressEvent::Advanced {
                run_id,
                percent,
                message,
                ..
            } => info!(%run_id, percent, "{}", message),
            ProgressEvent::Completed { run_id, .. } => info!(%run_id, "Run completed"),
            ProgressEvent::Failed { run_id, error, .. } => {
                tracing::error!(%run_id, "Run failed: {}", error)
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::load_default_config().context("loading default config")?,
    };
    telemetry::init_tracing(&config.logging);

    let db = Database::open(&config.database.path).context("opening database")?;

    match cli.command {
        Commands::Ingest { archives } => ingest(config, db, &archives),
        Commands::Resume { run_id } => resume(config, db, run_id),
        Commands::Status { run_id } => status(&db, &run_id),
        Commands::Threads { date } => threads(&db, date.as_deref()),
    }
}

fn ingest(config: Config, db: Database, archives: &[PathBuf]) -> anyhow::Result<()> {
    let intake = Intake::new(db.clone(), &config);
    let mut run_ids = Vec::with_capacity(archives.len());

    for path in archives {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let size = file
            .metadata()
            .with_context(|| format!("reading metadata of {}", path.display()))?
            .len();
        let name = file_name(path);

        let submission = intake
            .accept(file, &name, size)
            .with_context(|| format!("accepting {}", path.display()))?;
        println!("accepted {} as run {}", name, submission.run_id);
        run_ids.push(submission.run_id);
    }

    drive(config, db, run_ids)
}

fn resume(config: Config, db: Database, run_id: Option<String>) -> anyhow::Result<()> {
    let run_ids = match run_id {
        Some(id) => vec![id],
        None => run_repo::list_unfinished(&db)?
            .into_iter()
            .map(|run| run.id)
            .collect(),
    };
    if run_ids.is_empty() {
        println!("no unfinished runs");
        return Ok(());
    }
    drive(config, db, run_ids)
}

/// Runs every id through a worker pool and prints one summary per run.
fn drive(config: Config, db: Database, run_ids: Vec<String>) -> anyhow::Result<()> {
    let workers = config.worker_count.clamp(1, run_ids.len().max(1));
    let coordinator = Arc::new(PipelineCoordinator::with_reporter(
        Arc::new(config),
        db.clone(),
        Arc::new(ConsoleProgress),
    ));
    let pool = WorkerPool::new(coordinator, workers);

    let canceller = pool.canceller();
    ctrlc::set_handler(move || {
        eprintln!("interrupt received, cancelling runs");
        canceller.cancel_all();
    })
    .context("installing interrupt handler")?;

    for run_id in &run_ids {
        pool.submit(run_id)?;
    }

    let mut failures = 0;
    for _ in 0..run_ids.len() {
        let Some(outcome) = pool.recv_result() else {
            break;
        };
        if !outcome.is_success() {
            failures += 1;
        }
        print_outcome(&db, &outcome)?;
    }

    pool.shutdown();
    pool.wait();

    if failures > 0 {
        bail!("{} of {} runs failed", failures, run_ids.len());
    }
    Ok(())
}

fn print_outcome(db: &Database, outcome: &RunOutcome) -> anyhow::Result<()> {
    match run_repo::find_by_id(db, &outcome.run_id)? {
        Some(run) => print_run(&run),
        None => println!(
            "run {}: {}",
            outcome.run_id,
            outcome.error.as_deref().unwrap_or("unknown failure")
        ),
    }
    Ok(())
}

fn status(db: &Database, run_id: &str) -> anyhow::Result<()> {
    let Some(run) = run_repo::find_by_id(db, run_id)? else {
        bail!("run '{}' not found", run_id);
    };
    print_run(&run);
    Ok(())
}

fn print_run(run: &RunRow) {
    let summary = serde_json::json!({
        "runId": run.id,
        "archive": run.original_filename,
        "stage": run.stage,
        "progressPercent": run.progress_percent,
        "error": run.error,
        "filesExtracted": run.counters.files_extracted,
        "conversationsFound": run.counters.conversations_found,
        "messagesFound": run.counters.messages_found,
        "threadsFound": run.counters.threads_found,
        "createdAt": run.created_at,
        "completedAt": run.completed_at,
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{:?}", run),
    }
}

fn threads(db: &Database, date: Option<&str>) -> anyhow::Result<()> {
    let Some(date) = date else {
        for date in thread_repo::list_dates(db)? {
            println!("{}", date);
        }
        return Ok(());
    };
    if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
        bail!("'{}' is not a YYYY-MM-DD date", date);
    }

    let threads = thread_repo::list_by_date(db, date)?;
    if threads.is_empty() {
        println!("no threads on {}", date);
        return Ok(());
    }
    let messages = message_repo::list_by_date(db, date)?;
    for thread in threads {
        println!(
            "{}  conversation {}  {} messages  {} .. {}",
            thread.date,
            thread.conversation_id,
            thread.message_count,
            thread.start_timestamp,
            thread.end_timestamp
        );
        for message in messages
            .iter()
            .filter(|m| m.conversation_id == thread.conversation_id)
        {
            println!("    [{}] {}", message.role, first_line(&message.content));
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive.zip".to_string())
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    chatlog_ingest::sanitize::truncate_for_log(line, 100)
}
