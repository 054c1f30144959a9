//! Marteau worker
//!
//! Runs load-test jobs and manages the shared job and node store.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use marteau_core::config::{self, Config};
use marteau_worker::console::ConsoleBus;
use marteau_worker::job::{Job, JobTask, LoadTestArgs};
use marteau_worker::lifecycle::{JobLifecycleStore, JobWorker};
use marteau_worker::runner::LoadTestPipeline;
use marteau_worker::storage::{Database, Outcome};

#[derive(Parser, Debug)]
#[command(name = "marteau-worker")]
#[command(version, about = "Marteau worker - distributed load-test execution")]
struct Args {
    /// Database file path
    #[arg(long, global = true, env = "MARTEAU_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter for the worker (e.g. "info", "debug", "warn").
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "MARTEAU_LOG_JSON")]
    log_json: bool,

    /// Project directory holding `.marteau/settings.json`
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a load test
    Run {
        /// Git repository URL or local directory of the test
        repo: String,

        /// Job identifier (generated when omitted)
        #[arg(long)]
        job_id: Option<String>,

        /// Bench cycles, e.g. "10:20:30"
        #[arg(long)]
        cycles: Option<String>,

        /// Bench duration in seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Number of nodes, overriding the test configuration
        #[arg(long)]
        nodes: Option<u32>,

        /// Copy step output to stdout
        #[arg(long)]
        echo: bool,
    },
    /// Manage the node registry
    Nodes {
        #[command(subcommand)]
        command: NodesCommand,
    },
    /// Show the result of a job
    Result { job_id: String },
    /// Print the console of a job
    Console { job_id: String },
    /// List running, succeeded and failed jobs
    History,
    /// Clear job histories and retained consoles
    Purge,
    /// Drop expired results and consoles
    Sweep,
}

#[derive(Subcommand, Debug)]
enum NodesCommand {
    /// Register idle nodes
    Add {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List registered nodes
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(args.config_dir.as_deref())?;
    if let Some(level) = &args.log_level {
        config.worker.log_level.clone_from(level);
    }
    if let Some(path) = &args.db_path {
        config.worker.database_path = Some(path.clone());
    }

    let log_filter = format!("marteau_worker={}", config.worker.log_level);
    marteau_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let db_path = match &config.worker.database_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        path = %db_path.display(),
        "Opening database"
    );
    let db = Database::open(&db_path).await?;

    let lifecycle = JobLifecycleStore::new(db.clone())
        .with_ttl(Duration::from_secs(config.worker.result_ttl_secs));

    match args.command {
        Command::Run {
            repo,
            job_id,
            cycles,
            duration,
            nodes,
            echo,
        } => {
            let job_id = job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let job = Job::new(
                job_id.clone(),
                JobTask::RunLoadtest(LoadTestArgs {
                    repo,
                    cycles,
                    duration,
                    nodes,
                }),
            );
            run(db, config, lifecycle, job, echo).await?;
        }
        Command::Nodes { command } => match command {
            NodesCommand::Add { names } => {
                for name in names {
                    let added = db.register_node(&name).await?;
                    print_line(&format!(
                        "{name}: {}",
                        if added { "added" } else { "already registered" }
                    ));
                }
            }
            NodesCommand::List => {
                for node in db.list_nodes().await? {
                    print_line(&format!(
                        "{}\t{}\t{}",
                        node.name,
                        node.status,
                        node.reserved_by.as_deref().unwrap_or("-")
                    ));
                }
            }
        },
        Command::Result { job_id } => {
            let (result, _) = lifecycle.get_result(&job_id).await?;
            if let Some(result) = result {
                print_line(&serde_json::to_string_pretty(&result)?);
            } else if lifecycle.get_job(&job_id).await?.is_some() {
                print_line(&format!("{job_id}: running"));
            } else {
                anyhow::bail!("No result for job {job_id}");
            }
        }
        Command::Console { job_id } => {
            let console = ConsoleBus::new(db).get_console(&job_id).await?;
            let Some(bytes) = console else {
                anyhow::bail!("No console for job {job_id}");
            };
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
        Command::History => {
            for job in lifecycle.get_running_jobs().await? {
                print_job("running", &job);
            }
            for job in lifecycle.get_successes().await? {
                print_job("success", &job);
            }
            for job in lifecycle.get_failures().await? {
                print_job("failure", &job);
            }
        }
        Command::Purge => lifecycle.purge().await?,
        Command::Sweep => {
            let (results, chunks) = lifecycle.sweep_expired().await?;
            print_line(&format!("Swept {results} results, {chunks} console chunks"));
        }
    }

    Ok(())
}

async fn run(
    db: Database,
    config: Config,
    lifecycle: JobLifecycleStore,
    job: Job,
    echo: bool,
) -> anyhow::Result<()> {
    let job_id = job.job_id.clone();
    lifecycle.sweep_expired().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_shutdown_listener(shutdown_tx)?;

    let pipeline = LoadTestPipeline::new(db, config)
        .with_echo(echo)
        .with_shutdown(shutdown_rx);
    let pipeline = &pipeline;
    let worker = JobWorker::new(lifecycle);

    let outcome = worker
        .execute(job, move |job| async move { pipeline.run_job(&job).await })
        .await?;

    let (result, _) = worker.hooks().get_result(&job_id).await?;
    if let Some(result) = result {
        print_line(&serde_json::to_string_pretty(&result)?);
    }
    match outcome {
        Outcome::Success => Ok(()),
        Outcome::Failure => anyhow::bail!("Job {job_id} failed"),
    }
}

/// Flip `shutdown` on Ctrl+C or SIGTERM.
fn spawn_shutdown_listener(shutdown: watch::Sender<bool>) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
                info!("Received Ctrl+C shutdown signal");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM shutdown signal");
            }
        }
        let _ = shutdown.send(true);
    });
    Ok(())
}

/// Default database path: the XDG data dir, else `~/.marteau/marteau.db`.
fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = config::database_path() {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".marteau").join("marteau.db"))
}

fn print_job(state: &str, job: &Job) {
    print_line(&format!("{state}\t{}\t{}", job.job_id, job.function()));
}

#[allow(clippy::print_stdout)]
fn print_line(line: &str) {
    println!("{line}");
}
