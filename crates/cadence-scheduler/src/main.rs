use std::sync::Arc;

use anyhow::Context;
use cadence_core::config::CadenceConfig;
use cadence_scheduler::tasks::builtin_registry;
use cadence_scheduler::worker::run_worker;
use cadence_scheduler::{
    EventMask, JobStore, NewJob, Scheduler, SchedulerError, SchedulerEvent, SqliteJobStore,
};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

/// Process-per-run job scheduler.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Run {
        /// Start without processing due jobs until resumed
        #[arg(long)]
        paused: bool,
    },
    /// List stored jobs
    Jobs,
    /// Execute one job run read from stdin (launched by the scheduler)
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the worker protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Command::Worker = cli.command {
        std::process::exit(run_worker(&builtin_registry()));
    }

    let config = CadenceConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening job store");
    let store = Arc::new(SqliteJobStore::open(db_path).context("opening job store")?);

    match cli.command {
        Command::Run { paused } => run(config, store, paused).await,
        Command::Jobs => list_jobs(store.as_ref()),
        Command::Worker => Ok(()),
    }
}

async fn run(config: CadenceConfig, store: Arc<SqliteJobStore>, paused: bool) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(store, config.scheduler.clone(), config.executor.clone());

    scheduler.add_listener(EventMask::ALL, |event: &SchedulerEvent| {
        debug!(kind = %event.kind(), job_id = ?event.job_id(), success = ?event.success(), "event");
    });

    for spec in &config.jobs {
        let new_job = NewJob::from(spec);
        if let Some(id) = &spec.id {
            match scheduler.remove_job(id) {
                Ok(()) | Err(SchedulerError::JobNotFound { .. }) => {}
                Err(e) => return Err(e).context(format!("replacing job '{id}'")),
            }
        }
        let job = scheduler
            .add_job(new_job)
            .with_context(|| format!("registering job for task '{}'", spec.task))?;
        info!(job_id = %job.id, task = %job.task, next_run_time = ?job.next_run_time, "configured job registered");
    }

    scheduler.start(paused)?;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("interrupt received; waiting for running jobs");
    scheduler.shutdown(true).await?;
    Ok(())
}

fn list_jobs(store: &dyn JobStore) -> anyhow::Result<()> {
    let jobs = store.get_jobs(None)?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    for job in jobs {
        let next = job
            .next_run_time
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "paused".to_string());
        println!("{:<38} {:<12} {:<34} {}", job.id, job.task, next, job.name);
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %e, "could not create database directory");
            }
        }
    }
}
