// ABOUTME: Runs one backup job: database dump and folder mirroring together, then rclone sync
// ABOUTME: Every configured step and pair is attempted once and reported on its own

use chrono::{Local, NaiveDateTime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::command::{CommandRunner, CommandSpec, OutputSink};
use crate::config::{DatabaseTarget, JobDefinition, SyncPair};
use crate::error::{BackupError, Result};
use crate::naming;

/// Names of the external tools a job invokes.
#[derive(Debug, Clone)]
pub struct Tools {
    pub pg_dump: String,
    pub rsync: String,
    pub rclone: String,
    pub ssh: String,
    /// Run rsync inside WSL (Windows hosts have no native rsync).
    pub rsync_via_wsl: bool,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            pg_dump: "pg_dump".to_string(),
            rsync: "rsync".to_string(),
            rclone: "rclone".to_string(),
            ssh: "ssh".to_string(),
            rsync_via_wsl: cfg!(windows),
        }
    }
}

/// How the dump tool reaches the database, chosen once from the job's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpTransport {
    /// pg_dump runs here and connects over the network.
    Local,
    /// pg_dump runs on another host, reached through ssh.
    RemoteShell { host: String },
    /// Database lives in a container. Recognised but not supported.
    Container { name: String },
}

impl DumpTransport {
    pub fn select(target: &DatabaseTarget) -> Self {
        if let Some(name) = &target.container {
            return DumpTransport::Container { name: name.clone() };
        }
        match &target.remote_host {
            Some(host) => DumpTransport::RemoteShell { host: host.clone() },
            None => DumpTransport::Local,
        }
    }

    pub fn build(&self, target: &DatabaseTarget, tools: &Tools) -> Result<CommandSpec> {
        match self {
            DumpTransport::Local => Ok(with_password(
                CommandSpec::new(&tools.pg_dump).args(pg_dump_args(target)),
                target,
            )),
            DumpTransport::RemoteShell { host } => {
                let mut spec = CommandSpec::new(&tools.ssh);
                // ssh forwards the variable from our environment; it never
                // appears on either command line.
                if target.password.is_some() {
                    spec = spec.args(["-o", "SendEnv=PGPASSWORD"]);
                }
                let spec = spec
                    .arg(host)
                    .arg(&tools.pg_dump)
                    .args(pg_dump_args(target));
                Ok(with_password(spec, target))
            }
            DumpTransport::Container { name } => Err(BackupError::UnsupportedConfiguration(
                format!("database in container '{}' cannot be dumped yet", name),
            )),
        }
    }
}

fn pg_dump_args(target: &DatabaseTarget) -> Vec<String> {
    vec![
        "-d".to_string(),
        target.database.clone(),
        "-U".to_string(),
        target.user.clone(),
        "-p".to_string(),
        target.port.to_string(),
        "-h".to_string(),
        target.host.clone(),
        // no ownership, no privileges, tar archive
        "-O".to_string(),
        "-x".to_string(),
        "-Ft".to_string(),
    ]
}

fn with_password(spec: CommandSpec, target: &DatabaseTarget) -> CommandSpec {
    match &target.password {
        Some(password) => spec.env("PGPASSWORD", password),
        None => spec,
    }
}

#[derive(Debug)]
pub enum DatabaseOutcome {
    /// The job has no database configured.
    Skipped,
    Succeeded { artifact: PathBuf },
    /// `artifact` is set when the file was created before the failure; it is left in place.
    Failed {
        artifact: Option<PathBuf>,
        error: BackupError,
    },
}

#[derive(Debug)]
pub struct PairOutcome {
    pub pair: SyncPair,
    pub result: Result<()>,
}

impl PairOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-step outcome of one job run.
#[derive(Debug)]
pub struct RunResult {
    pub job: String,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub database: DatabaseOutcome,
    pub folder_sync: Vec<PairOutcome>,
    pub remote_sync: Vec<PairOutcome>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }

    /// Every failed step or pair, labelled with where it happened.
    pub fn failures(&self) -> Vec<(String, &BackupError)> {
        let mut failures = Vec::new();
        if let DatabaseOutcome::Failed { error, .. } = &self.database {
            failures.push(("database".to_string(), error));
        }
        for (label, outcomes) in [("folder", &self.folder_sync), ("remote", &self.remote_sync)] {
            for outcome in outcomes {
                if let Err(error) = &outcome.result {
                    failures.push((
                        format!("{} {} -> {}", label, outcome.pair.from, outcome.pair.to),
                        error,
                    ));
                }
            }
        }
        failures
    }

    fn log_summary(&self) {
        let failures = self.failures();
        if failures.is_empty() {
            info!(job = %self.job, "Backup finished without errors");
            return;
        }
        for (step, err) in &failures {
            error!(job = %self.job, step = %step, "Backup step failed: {}", err);
        }
        warn!(
            job = %self.job,
            failed = failures.len(),
            "Backup finished with failures"
        );
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

pub struct JobOrchestrator<R> {
    runner: Arc<R>,
    tools: Tools,
    clock: fn() -> NaiveDateTime,
}

impl<R> Clone for JobOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            tools: self.tools.clone(),
            clock: self.clock,
        }
    }
}

impl<R: CommandRunner> JobOrchestrator<R> {
    pub fn new(runner: Arc<R>, tools: Tools) -> Self {
        Self {
            runner,
            tools,
            clock: local_now,
        }
    }

    /// Replace the wall clock used for artifact names and run timestamps.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    /// Run every step of `job` once. Never stops early: the dump and the
    /// folder mirroring run together, and rclone sync starts only after
    /// both have finished, whatever their outcome.
    pub async fn run(&self, job: &JobDefinition) -> RunResult {
        let started_at = self.now();
        info!(job = %job.name, "Starting backup");

        let (database, folder_sync) =
            tokio::join!(self.database_step(job), self.folder_sync_step(job));
        let remote_sync = self.remote_sync_step(job).await;

        let result = RunResult {
            job: job.name.clone(),
            started_at,
            finished_at: self.now(),
            database,
            folder_sync,
            remote_sync,
        };
        result.log_summary();
        result
    }

    async fn database_step(&self, job: &JobDefinition) -> DatabaseOutcome {
        if !job.database.is_configured() {
            return DatabaseOutcome::Skipped;
        }
        info!(job = %job.name, "Starting database dump");

        let spec = match DumpTransport::select(&job.database).build(&job.database, &self.tools) {
            Ok(spec) => spec,
            Err(error) => {
                return DatabaseOutcome::Failed {
                    artifact: None,
                    error,
                }
            }
        };

        let artifact = job.destination_folder.join(naming::new_name(self.now()));
        let file = match create_artifact(&artifact).await {
            Ok(file) => file,
            Err(error) => {
                return DatabaseOutcome::Failed {
                    artifact: None,
                    error,
                }
            }
        };

        let outcome = match self
            .runner
            .run(&spec, OutputSink::File(file), OutputSink::Log)
            .await
        {
            Ok(_) => DatabaseOutcome::Succeeded { artifact },
            Err(error) => DatabaseOutcome::Failed {
                artifact: Some(artifact),
                error,
            },
        };
        info!(job = %job.name, "Database dump finished");
        outcome
    }

    async fn folder_sync_step(&self, job: &JobDefinition) -> Vec<PairOutcome> {
        if job.folder_pairs.is_empty() {
            return Vec::new();
        }
        info!(job = %job.name, pairs = job.folder_pairs.len(), "Starting folder sync");

        let mut outcomes = Vec::with_capacity(job.folder_pairs.len());
        for pair in &job.folder_pairs {
            let result = self.run_logged(&self.rsync_spec(pair)).await;
            outcomes.push(PairOutcome {
                pair: pair.clone(),
                result,
            });
        }

        info!(job = %job.name, "Folder sync finished");
        outcomes
    }

    async fn remote_sync_step(&self, job: &JobDefinition) -> Vec<PairOutcome> {
        if job.remote_sync_pairs.is_empty() {
            return Vec::new();
        }
        info!(job = %job.name, pairs = job.remote_sync_pairs.len(), "Starting rclone sync");

        let mut outcomes = Vec::with_capacity(job.remote_sync_pairs.len());
        for pair in &job.remote_sync_pairs {
            let spec = CommandSpec::new(&self.tools.rclone)
                .arg("sync")
                .arg(&pair.from)
                .arg(&pair.to);
            let result = self.run_logged(&spec).await;
            outcomes.push(PairOutcome {
                pair: pair.clone(),
                result,
            });
        }

        info!(job = %job.name, "Rclone sync finished");
        outcomes
    }

    fn rsync_spec(&self, pair: &SyncPair) -> CommandSpec {
        let spec = if self.tools.rsync_via_wsl {
            CommandSpec::new("wsl").arg(&self.tools.rsync)
        } else {
            CommandSpec::new(&self.tools.rsync)
        };
        spec.args(["-avvHPS", "--rsh=ssh"])
            .arg(&pair.from)
            .arg(&pair.to)
    }

    async fn run_logged(&self, spec: &CommandSpec) -> Result<()> {
        self.runner
            .run(spec, OutputSink::Log, OutputSink::Log)
            .await
            .map(|_| ())
    }
}

async fn create_artifact(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BackupError::artifact_io(parent, e))?;
    }
    // Never reuse a name: an existing file is someone else's artifact.
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| BackupError::artifact_io(path, e))?;
    Ok(file.into_std().await)
}
