// ABOUTME: Command-line entry point for the backup tool
// ABOUTME: Parses arguments, loads job files and dispatches to backup, scheduler, sweep or log

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use pg_folder_backup::{
    config, logging, logtail, retention, AppPaths, JobOrchestrator, ProcessRunner, Scheduler,
    Tools,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "pg-folder-backup")]
#[command(about = "Back up PostgreSQL databases and folders on demand or on a daily schedule", long_about = None)]
#[command(version)]
struct Cli {
    /// Log to <app-dir>/backup.log instead of the console
    #[arg(short = 'l', long = "logfile", global = true)]
    log_to_file: bool,

    /// Directory holding config/ and backup.log (defaults to the executable's directory)
    #[arg(long, env = "PG_FOLDER_BACKUP_DIR", global = true)]
    app_dir: Option<PathBuf>,

    #[command(flatten)]
    tools: ToolArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ToolArgs {
    /// pg_dump executable
    #[arg(long, global = true, default_value = "pg_dump")]
    pg_dump: String,

    /// rsync executable
    #[arg(long, global = true, default_value = "rsync")]
    rsync: String,

    /// rclone executable
    #[arg(long, global = true, default_value = "rclone")]
    rclone: String,

    /// ssh executable used to reach remote database hosts
    #[arg(long, global = true, default_value = "ssh")]
    ssh: String,

    /// Seconds running tools get to finish after Ctrl-C before they are killed
    #[arg(long, global = true, default_value_t = 30)]
    grace_secs: u64,
}

impl ToolArgs {
    fn tools(&self) -> Tools {
        Tools {
            pg_dump: self.pg_dump.clone(),
            rsync: self.rsync.clone(),
            rclone: self.rclone.clone(),
            ssh: self.ssh.clone(),
            ..Tools::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one job now (no retention sweep)
    Backup {
        /// Job name: config/<name>.json or config/<name>.toml
        name: String,
    },
    /// Start the daily scheduler for every job; stops on Ctrl-C
    Scheduler,
    /// Delete expired dump artifacts of every job
    DeleteOld,
    /// Print the last lines of the log file
    Log {
        #[arg(short = 'n', long = "lines", default_value_t = logtail::DEFAULT_TAIL_LINES)]
        lines: usize,
    },
    /// List the configured jobs and their trigger times
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.app_dir {
        Some(dir) => AppPaths::new(dir),
        None => AppPaths::from_executable()?,
    };
    let log_file = paths.log_file();
    logging::init(cli.log_to_file.then_some(log_file.as_path()))?;

    let cancel = CancellationToken::new();
    let runner = Arc::new(
        ProcessRunner::new(cancel.clone())
            .with_grace_period(Duration::from_secs(cli.tools.grace_secs)),
    );
    let orchestrator = JobOrchestrator::new(runner, cli.tools.tools());

    match cli.command {
        Commands::Backup { name } => {
            let job = config::load_job(&paths.config_dir(), &name)?;
            let result = pg_folder_backup::run_job_once(&orchestrator, &job).await;
            let failures = result.failures();
            if !failures.is_empty() {
                bail!(
                    "Backup '{}' finished with {} failed step(s)",
                    job.name,
                    failures.len()
                );
            }
            Ok(())
        }
        Commands::Scheduler => {
            let jobs = config::load_jobs(&paths.config_dir())?;
            let scheduler = Scheduler::new(orchestrator, &jobs, cancel.clone())
                .context("Failed to register backup triggers")?;

            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Ctrl-C received, shutting down");
                    shutdown.cancel();
                }
            });

            tracing::info!("Starting scheduler");
            let handle = scheduler.start().await;
            cancel.cancelled().await;
            handle.shutdown().await;
            Ok(())
        }
        Commands::DeleteOld => {
            let jobs = config::load_jobs(&paths.config_dir())?;
            let now = Local::now().naive_local();
            let mut errors = 0;
            for job in &jobs {
                let report = retention::sweep_job(job, now).await;
                for err in &report.errors {
                    tracing::error!(job = %job.name, "{}", err);
                }
                errors += report.errors.len();
            }
            if errors > 0 {
                bail!("{} artifact(s) could not be deleted", errors);
            }
            Ok(())
        }
        Commands::Log { lines } => {
            for line in logtail::read_tail(&log_file, lines)? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::List => {
            let jobs = config::load_jobs(&paths.config_dir())?;
            for job in &jobs {
                let times = if job.trigger_times.is_empty() {
                    "-".to_string()
                } else {
                    job.trigger_times.join(", ")
                };
                println!(
                    "{}\tat {}{}\tkeep {} day(s)",
                    job.name,
                    times,
                    if job.run_at_startup { " + startup" } else { "" },
                    job.retention_days
                );
            }
            Ok(())
        }
    }
}
