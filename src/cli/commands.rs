//! CLI command definitions for queuectl.
//!
//! Every command opens the queue database named by `--db`, performs one
//! operation, prints the result and exits. Only `init` creates the file;
//! every other command fails if the store has not been initialized.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::ConfigKey;
use crate::scheduler::{self, JobDescriptor, JobQueue, JobState, QueueError};

/// Default database file, relative to the working directory.
const DEFAULT_DB_PATH: &str = "queue.db";

/// Width of the error column in `dlq list`.
const DLQ_ERROR_WIDTH: usize = 50;

/// Persistent shell-command job queue with retries and a dead letter queue.
#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Persistent job queue with workers, retries and a dead letter queue")]
#[command(version)]
#[command(
    long_about = "queuectl stores shell-command jobs in a SQLite database and runs them with \
background worker processes. Failed jobs are retried with exponential backoff and moved \
to a dead letter queue once their retries are exhausted.\n\nExample usage:\n  queuectl init\n  \
queuectl enqueue '{\"id\":\"job1\",\"command\":\"echo hello\"}'\n  queuectl worker start --count 2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the queue database.
    #[arg(long, env = "QUEUECTL_DB", default_value = DEFAULT_DB_PATH, global = true)]
    pub db: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Create the queue database and seed default config.
    Init,

    /// Add a job from inline JSON or @path/to/job.json.
    Enqueue(EnqueueArgs),

    /// Start or stop workers.
    Worker(WorkerArgs),

    /// List jobs.
    List(ListArgs),

    /// Show job counts and active workers.
    Status(StatusArgs),

    /// Inspect or replay the dead letter queue.
    Dlq(DlqArgs),

    /// Read or change runtime configuration.
    Config(ConfigArgs),
}

/// Arguments for `queuectl enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Job descriptor: {"id": "...", "command": "...", "max_retries": N, "run_at": "RFC 3339"}.
    pub job: String,
}

#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum WorkerSubcommand {
    /// Launch background worker processes.
    Start {
        /// Number of workers to start.
        #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,

        /// Run the workers in this process instead of detaching.
        #[arg(long)]
        foreground: bool,
    },

    /// Ask every running worker to stop after its current job.
    Stop,

    /// Run a single worker in the foreground.
    #[command(hide = true)]
    Run,
}

/// Arguments for `queuectl list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only show jobs in this state (pending, processing, completed, dead).
    #[arg(short, long)]
    pub state: Option<JobState>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `queuectl status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct DlqArgs {
    #[command(subcommand)]
    pub command: DlqSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum DlqSubcommand {
    /// List dead-lettered jobs, most recent first.
    List {
        /// Output JSON.
        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Re-enqueue a dead-lettered job with a fresh retry budget.
    Retry {
        /// Job id.
        id: String,
    },
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Show config values.
    Get {
        /// Only show this key.
        key: Option<String>,

        /// Output JSON.
        #[arg(short = 'j', long)]
        json: bool,
    },

    /// Set a config value (max-retries, backoff-base, poll-interval-sec, timeout-seconds).
    Set { key: String, value: String },
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init => run_init_command(&cli.db).await,
        Commands::Enqueue(args) => run_enqueue_command(&cli.db, args).await,
        Commands::Worker(args) => run_worker_command(&cli.db, &cli.log_level, args).await,
        Commands::List(args) => run_list_command(&cli.db, args).await,
        Commands::Status(args) => run_status_command(&cli.db, args).await,
        Commands::Dlq(args) => run_dlq_command(&cli.db, args).await,
        Commands::Config(args) => run_config_command(&cli.db, args).await,
    }
}

async fn open_queue(db: &Path) -> anyhow::Result<JobQueue> {
    JobQueue::open(db).await.with_context(|| {
        format!(
            "Queue database {} is not available (run `queuectl init` first)",
            db.display()
        )
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Init / Enqueue
// ============================================================================

async fn run_init_command(db: &Path) -> anyhow::Result<()> {
    JobQueue::initialize(db).await?;
    let path = std::fs::canonicalize(db).unwrap_or_else(|_| db.to_path_buf());
    println!("Initialized queue database at {}", path.display());
    Ok(())
}

async fn run_enqueue_command(db: &Path, args: EnqueueArgs) -> anyhow::Result<()> {
    let descriptor = JobDescriptor::parse(&args.job)?;
    let queue = open_queue(db).await?;

    match queue.enqueue(descriptor).await {
        Ok(job) => {
            println!(
                "Enqueued job '{}' (scheduled at {})",
                job.id,
                job.next_run_at.to_rfc3339()
            );
            Ok(())
        }
        Err(QueueError::DuplicateJob(id)) => {
            println!("Job '{}' already exists.", id);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Worker Commands
// ============================================================================

async fn run_worker_command(db: &Path, log_level: &str, args: WorkerArgs) -> anyhow::Result<()> {
    match args.command {
        WorkerSubcommand::Start { count, foreground } => {
            let queue = open_queue(db).await?;
            if foreground {
                info!(count = count, "Running workers in the foreground");
                scheduler::run_workers(queue, count as usize).await?;
            } else {
                spawn_detached_workers(db, log_level, count)?;
                println!("Started {} background worker(s)", count);
            }
            Ok(())
        }
        WorkerSubcommand::Stop => {
            let queue = open_queue(db).await?;
            let signaled = queue.stop_workers().await?;
            println!("Signaled {} worker(s) to stop gracefully", signaled);
            Ok(())
        }
        WorkerSubcommand::Run => {
            let queue = open_queue(db).await?;
            scheduler::run_workers(queue, 1).await?;
            Ok(())
        }
    }
}

/// Re-invokes this executable as `worker run` once per worker.
fn spawn_detached_workers(db: &Path, log_level: &str, count: u32) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the queuectl executable")?;
    let db = std::fs::canonicalize(db).unwrap_or_else(|_| db.to_path_buf());

    for _ in 0..count {
        let child = std::process::Command::new(&exe)
            .arg("--db")
            .arg(&db)
            .arg("--log-level")
            .arg(log_level)
            .arg("worker")
            .arg("run")
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn worker process {}", exe.display()))?;
        info!(pid = child.id(), "Spawned worker process");
    }
    Ok(())
}

// ============================================================================
// Inspection Commands
// ============================================================================

async fn run_list_command(db: &Path, args: ListArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;
    let jobs = queue.list(args.state).await?;

    if args.json {
        return print_json(&jobs);
    }

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}\t{}\t{}/{}\t{}\t(run_at: {})",
            job.id,
            job.state,
            job.attempts,
            job.max_retries,
            job.command,
            job.next_run_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn run_status_command(db: &Path, args: StatusArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;
    let report = queue.status().await?;

    if args.json {
        return print_json(&report);
    }

    let path = std::fs::canonicalize(db).unwrap_or_else(|_| db.to_path_buf());
    println!("=== queuectl status ===");
    println!("Database: {}", path.display());
    println!();
    println!("Jobs:");
    for state in JobState::ALL {
        println!("  {:<10} {}", state.as_str(), report.count(state));
    }
    println!("  {:<10} {}", "dlq", report.dead_letters);
    println!();
    println!("Workers:");
    if report.workers.is_empty() {
        println!("  (no active workers)");
    }
    for worker in &report.workers {
        println!(
            "  {}\tPID={}\tstate={}\theartbeat={}",
            worker.id,
            worker.pid,
            worker.desired_state,
            worker.last_heartbeat.to_rfc3339()
        );
    }
    Ok(())
}

// ============================================================================
// Dead Letter Commands
// ============================================================================

async fn run_dlq_command(db: &Path, args: DlqArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;

    match args.command {
        DlqSubcommand::List { json } => {
            let records = queue.dead_letters().await?;
            if json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("Dead Letter Queue is empty");
                return Ok(());
            }
            println!("id\tattempts\tfailed_at\tlast_error");
            for record in records {
                let error = record.last_error.as_deref().unwrap_or("");
                println!(
                    "{}\t{}\t{}\t{}",
                    record.id,
                    record.attempts,
                    record.failed_at.to_rfc3339(),
                    truncate(error, DLQ_ERROR_WIDTH)
                );
            }
            Ok(())
        }
        DlqSubcommand::Retry { id } => {
            match queue.replay(&id).await {
                Ok(job) => println!("Re-enqueued DLQ job '{}'", job.id),
                Err(QueueError::NotFound(id)) => println!("DLQ job '{}' not found.", id),
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

// ============================================================================
// Config Commands
// ============================================================================

async fn run_config_command(db: &Path, args: ConfigArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;
    let config = queue.config();

    match args.command {
        ConfigSubcommand::Get { key, json } => {
            let values = match key {
                Some(key) => {
                    let key: ConfigKey = key.parse()?;
                    vec![(key, config.get(key).await?)]
                }
                None => config.get_all().await?,
            };

            if json {
                let map: serde_json::Map<String, serde_json::Value> = values
                    .into_iter()
                    .map(|(key, value)| (key.cli_name().to_string(), value.into()))
                    .collect();
                return print_json(&map);
            }
            for (key, value) in values {
                println!("{} = {}", key, value);
            }
            Ok(())
        }
        ConfigSubcommand::Set { key, value } => {
            let key: ConfigKey = key.parse()?;
            let stored = config.set(key, &value).await?;
            println!("Set {} = {}", key, stored);
            Ok(())
        }
    }
}
