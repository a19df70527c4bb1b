// ABOUTME: Library root for the backup tool: job runs, retention sweeps and scheduling
// ABOUTME: The binary in main.rs is a thin CLI over the operations exported here

pub mod command;
pub mod config;
pub mod error;
pub mod logging;
pub mod logtail;
pub mod naming;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;

use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;

pub use command::{CommandRunner, CommandSpec, OutputSink, ProcessRunner};
pub use config::{AppPaths, DatabaseTarget, JobDefinition, SyncPair};
pub use error::BackupError;
pub use orchestrator::{DatabaseOutcome, JobOrchestrator, PairOutcome, RunResult, Tools};
pub use retention::SweepReport;
pub use scheduler::{Scheduler, SchedulerHandle};

/// Back up one job right now, without a retention sweep.
pub async fn run_job_once<R: CommandRunner>(
    orchestrator: &JobOrchestrator<R>,
    job: &JobDefinition,
) -> RunResult {
    orchestrator.run(job).await
}

/// Delete the expired artifacts of one job.
pub async fn sweep_job(job: &JobDefinition, now: NaiveDateTime) -> SweepReport {
    retention::sweep_job(job, now).await
}

/// Run the startup backups and start the daily triggers for `jobs`.
pub async fn start_scheduler<R: CommandRunner + 'static>(
    orchestrator: JobOrchestrator<R>,
    jobs: &[JobDefinition],
    cancel: CancellationToken,
) -> error::Result<SchedulerHandle> {
    Ok(Scheduler::new(orchestrator, jobs, cancel)?.start().await)
}
