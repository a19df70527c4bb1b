// ABOUTME: Daily trigger scheduler that sweeps and backs up each job at its configured times
// ABOUTME: One task per job so a job never overlaps itself; cancellation stops new firings

use chrono::{Days, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::CommandRunner;
use crate::config::JobDefinition;
use crate::error::{BackupError, Result};
use crate::orchestrator::{JobOrchestrator, RunResult};
use crate::retention::{self, SweepReport};

/// Parse a time of day written as `HH:MM:SS` or `HH:MM`.
pub fn parse_trigger_time(text: &str) -> Result<NaiveTime> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .map_err(|_| {
            BackupError::InvalidConfiguration(format!(
                "'{}' is not a time of day (expected HH:MM:SS)",
                text
            ))
        })
}

/// First trigger instant strictly after `after`.
pub fn next_fire(times: &[NaiveTime], after: NaiveDateTime) -> Option<NaiveDateTime> {
    times
        .iter()
        .filter_map(|time| {
            let today = after.date().and_time(*time);
            if today > after {
                Some(today)
            } else {
                after
                    .date()
                    .checked_add_days(Days::new(1))
                    .map(|d| d.and_time(*time))
            }
        })
        .min()
}

/// Number of trigger instants in `(from, to]`.
pub fn triggers_between(times: &[NaiveTime], from: NaiveDateTime, to: NaiveDateTime) -> usize {
    let mut count = 0;
    let mut cursor = from;
    while let Some(next) = next_fire(times, cursor) {
        if next > to {
            break;
        }
        count += 1;
        cursor = next;
    }
    count
}

/// A job bound to its daily trigger times.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub job: Arc<JobDefinition>,
    pub times: Vec<NaiveTime>,
}

impl ScheduleEntry {
    pub fn new(job: Arc<JobDefinition>) -> Result<Self> {
        let mut times = job
            .trigger_times
            .iter()
            .map(|t| parse_trigger_time(t))
            .collect::<Result<Vec<_>>>()?;
        times.sort();
        times.dedup();
        Ok(Self { job, times })
    }
}

/// Sweep old artifacts, then back the job up. Sweeping first keeps the
/// sweep away from the dump this same firing is about to write.
pub async fn sweep_then_run<R: CommandRunner>(
    orchestrator: &JobOrchestrator<R>,
    job: &JobDefinition,
) -> (SweepReport, RunResult) {
    let report = retention::sweep_job(job, orchestrator.now()).await;
    let result = orchestrator.run(job).await;
    (report, result)
}

pub struct Scheduler<R> {
    orchestrator: JobOrchestrator<R>,
    entries: Vec<ScheduleEntry>,
    cancel: CancellationToken,
}

impl<R: CommandRunner + 'static> Scheduler<R> {
    /// Register every job. Fails if any trigger time does not parse.
    pub fn new(
        orchestrator: JobOrchestrator<R>,
        jobs: &[JobDefinition],
        cancel: CancellationToken,
    ) -> Result<Self> {
        let entries = jobs
            .iter()
            .map(|job| ScheduleEntry::new(Arc::new(job.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            orchestrator,
            entries,
            cancel,
        })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Run the startup backups, then hand the daily triggers to background tasks.
    ///
    /// Returns once every job flagged `run_at_startup` has been swept and
    /// backed up, so no timed trigger can fire before them.
    pub async fn start(self) -> SchedulerHandle {
        for entry in &self.entries {
            if self.cancel.is_cancelled() {
                break;
            }
            if entry.job.run_at_startup {
                info!(job = %entry.job.name, "Running startup backup");
                sweep_then_run(&self.orchestrator, &entry.job).await;
            }
        }

        let mut tasks = Vec::new();
        for entry in self.entries {
            if entry.times.is_empty() {
                continue;
            }
            info!(job = %entry.job.name, triggers = entry.times.len(), "Registered daily triggers");
            let orchestrator = self.orchestrator.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(job_loop(orchestrator, entry, cancel)));
        }

        info!(tasks = tasks.len(), "Scheduler started");
        SchedulerHandle {
            cancel: self.cancel,
            tasks,
        }
    }
}

async fn job_loop<R: CommandRunner>(
    orchestrator: JobOrchestrator<R>,
    entry: ScheduleEntry,
    cancel: CancellationToken,
) {
    let name = entry.job.name.clone();
    let mut last_fired: Option<NaiveDateTime> = None;

    loop {
        let now = orchestrator.now();
        // Never fire the same trigger twice, even if the timer woke early.
        let after = last_fired.map_or(now, |fired| fired.max(now));
        let Some(next) = next_fire(&entry.times, after) else {
            warn!(job = %name, "No further trigger times, stopping");
            return;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(job = %name, next = %next, "Next backup scheduled");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        info!(job = %name, trigger = %next, "Trigger fired");
        sweep_then_run(&orchestrator, &entry.job).await;
        last_fired = Some(next);

        let missed = triggers_between(&entry.times, next, orchestrator.now());
        if missed > 0 {
            warn!(
                job = %name,
                missed,
                "Skipped triggers that came due while the previous backup was running"
            );
            last_fired = Some(orchestrator.now());
        }
    }

    info!(job = %name, "Scheduler stopped for job");
}

/// Running scheduler. Dropping it leaves the tasks running; call `shutdown` to stop them.
pub struct SchedulerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Number of jobs with at least one daily trigger.
    pub fn job_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop firing triggers and wait for in-flight backups to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}
