// ABOUTME: Runs one external tool and supervises it until it exits
// ABOUTME: Streams tool output to files or the log and maps exit status to typed errors

use async_trait::async_trait;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BackupError, Result};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// How long output forwarders may keep draining after a tool was killed.
const DRAIN_AFTER_KILL: Duration = Duration::from_secs(2);

/// Program, arguments and extra environment for one external operation.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra variables layered over the inherited environment. Credentials go
    /// here rather than in `args` so they never show up in process listings.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

// Environment values are left out: they carry passwords.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .finish()
    }
}

/// Destination for one output stream of a tool.
#[derive(Debug)]
pub enum OutputSink {
    /// Pass through to this process's own stream.
    Inherit,
    Null,
    /// Write raw bytes into an already opened file.
    File(std::fs::File),
    /// Forward each line as a log event tagged with the program name.
    Log,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn label(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

impl OutputSink {
    fn stdio(&self) -> Result<Stdio> {
        Ok(match self {
            OutputSink::Inherit => Stdio::inherit(),
            OutputSink::Null => Stdio::null(),
            OutputSink::Log => Stdio::piped(),
            OutputSink::File(file) => {
                let file = file
                    .try_clone()
                    .map_err(|e| BackupError::artifact_io("<output file>", e))?;
                Stdio::from(file)
            }
        })
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` once and wait for it to exit.
    ///
    /// Succeeds only on exit status 0. A non-zero exit is
    /// `BackupError::CommandFailed`; a tool that cannot be started is
    /// `BackupError::CommandUnavailable`. No retries.
    async fn run(&self, spec: &CommandSpec, stdout: OutputSink, stderr: OutputSink)
        -> Result<ExitStatus>;
}

/// Runs tools as child processes of this one.
///
/// When the cancellation token fires, running children get `grace_period`
/// to exit on their own and are then killed; tools are not started at all
/// once cancellation has been requested.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    cancel: CancellationToken,
    grace_period: Duration,
}

impl ProcessRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn spawn(&self, spec: &CommandSpec, stdout: &OutputSink, stderr: &OutputSink) -> Result<Child> {
        let path = which::which(&spec.program)
            .map_err(|e| BackupError::unavailable(&spec.program, e))?;

        let mut command = Command::new(path);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout.stdio()?)
            .stderr(stderr.stdio()?)
            .kill_on_drop(true);
        // Own process group, so a kill also reaches whatever the tool started (ssh, ...).
        #[cfg(unix)]
        command.process_group(0);

        command
            .spawn()
            .map_err(|e| BackupError::unavailable(&spec.program, e))
    }

    async fn terminate(&self, child: &mut Child, program: &str) -> std::io::Result<ExitStatus> {
        warn!(
            program,
            grace_secs = self.grace_period.as_secs(),
            "Shutdown requested, waiting for running tool to finish"
        );
        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(program, "Grace period elapsed, killing tool");
                kill_process_group(child, program);
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<ExitStatus> {
        let program = spec.program.as_str();
        if self.cancel.is_cancelled() {
            return Err(BackupError::Cancelled {
                program: program.to_string(),
            });
        }

        debug!(command = %spec, "Starting tool");
        let mut child = self.spawn(spec, &stdout, &stderr)?;

        let mut forwarders = Vec::new();
        if let Some(out) = child.stdout.take() {
            forwarders.push(forward_lines(out, program.to_string(), Stream::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            forwarders.push(forward_lines(err, program.to_string(), Stream::Stderr));
        }

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = self.cancel.cancelled() => None,
        };
        let interrupted = finished.is_none();
        let status = match finished {
            Some(status) => status,
            None => self.terminate(&mut child, program).await,
        }
        .map_err(|e| BackupError::unavailable(program, e))?;

        drain(forwarders, program, interrupted).await;

        match status.code() {
            Some(0) => Ok(status),
            Some(exit_code) => Err(BackupError::CommandFailed {
                program: program.to_string(),
                exit_code,
            }),
            None => Err(BackupError::CommandTerminated {
                program: program.to_string(),
            }),
        }
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child, program: &str) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(program, "Failed to kill process group: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child, _program: &str) {}

/// Wait for the output forwarders. After an interrupted run they only get
/// `DRAIN_AFTER_KILL`, since a surviving descendant may hold the pipe open.
async fn drain(forwarders: Vec<JoinHandle<()>>, program: &str, interrupted: bool) {
    let deadline = tokio::time::Instant::now() + DRAIN_AFTER_KILL;
    for mut forwarder in forwarders {
        let joined = if interrupted {
            match tokio::time::timeout_at(deadline, &mut forwarder).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(program, "Tool output still open after kill, dropping it");
                    forwarder.abort();
                    continue;
                }
            }
        } else {
            forwarder.await
        };
        if let Err(e) = joined {
            warn!(program, "Output forwarder ended abnormally: {}", e);
        }
    }
}

fn forward_lines<R>(reader: R, program: String, stream: Stream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    match stream {
                        Stream::Stdout => info!(program = %program, stream = stream.label(), "{}", line),
                        Stream::Stderr => warn!(program = %program, stream = stream.label(), "{}", line),
                    }
                }
                Err(e) => {
                    warn!(program = %program, stream = stream.label(), "Failed to read tool output: {}", e);
                    break;
                }
            }
        }
    })
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(CancellationToken::new())
    }

    #[test]
    fn test_display_omits_environment() {
        let spec = CommandSpec::new("pg_dump")
            .args(["-d", "app"])
            .env("PGPASSWORD", "hunter2");
        assert_eq!(spec.to_string(), "pg_dump -d app");
        assert!(!format!("{:?}", spec).contains("hunter2"));
    }

    #[tokio::test]
    async fn test_zero_exit_is_ok() {
        let status = runner()
            .run(&CommandSpec::new("true"), OutputSink::Null, OutputSink::Null)
            .await
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_command_failed() {
        let err = runner()
            .run(
                &CommandSpec::new("sh").args(["-c", "exit 3"]),
                OutputSink::Null,
                OutputSink::Log,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackupError::CommandFailed { exit_code: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let err = runner()
            .run(
                &CommandSpec::new("definitely-not-a-real-tool-4242"),
                OutputSink::Null,
                OutputSink::Null,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::CommandUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_stdout_streams_into_file_and_env_is_passed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tar");
        let file = std::fs::File::create(&path).unwrap();

        runner()
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "printf '%s' \"$BACKUP_SECRET\""])
                    .env("BACKUP_SECRET", "payload"),
                OutputSink::File(file),
                OutputSink::Log,
            )
            .await
            .unwrap();

        let mut content = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "payload");
    }

    #[tokio::test]
    async fn test_cancelled_runner_does_not_start_tools() {
        let token = CancellationToken::new();
        token.cancel();
        let err = ProcessRunner::new(token)
            .run(&CommandSpec::new("true"), OutputSink::Null, OutputSink::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_kills_after_grace_period() {
        let token = CancellationToken::new();
        let runner = ProcessRunner::new(token.clone()).with_grace_period(Duration::from_millis(50));

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let err = runner
            .run(
                &CommandSpec::new("sleep").arg("30"),
                OutputSink::Null,
                OutputSink::Null,
            )
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, BackupError::CommandTerminated { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_also_kills_tool_descendants() {
        let token = CancellationToken::new();
        let runner = ProcessRunner::new(token.clone()).with_grace_period(Duration::from_millis(50));

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        // The background sleep inherits both pipes and would keep them open.
        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            runner.run(
                &CommandSpec::new("sh").args(["-c", "sleep 30 & sleep 30"]),
                OutputSink::Log,
                OutputSink::Log,
            ),
        )
        .await
        .expect("run did not return after the grace period");
        canceller.await.unwrap();

        assert!(matches!(
            outcome,
            Err(BackupError::CommandTerminated { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
