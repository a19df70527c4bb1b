// ABOUTME: Typed error taxonomy for backup steps and retention sweeps
// ABOUTME: Lets callers tell a failed tool run apart from a missing tool or a bad job shape

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// The tool ran and exited with a non-zero status.
    #[error("{program} exited with status {exit_code}")]
    CommandFailed { program: String, exit_code: i32 },

    /// The tool could not be started at all.
    #[error("{program} is not available: {reason}")]
    CommandUnavailable { program: String, reason: String },

    /// The tool was killed before it could report an exit code.
    #[error("{program} was terminated before it finished")]
    CommandTerminated { program: String },

    /// Not started because shutdown was already requested.
    #[error("{program} was not started: shutdown in progress")]
    Cancelled { program: String },

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Artifact I/O error on {}: {source}", path.display())]
    ArtifactIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl BackupError {
    pub fn artifact_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BackupError::ArtifactIo {
            path: path.into(),
            source,
        }
    }

    pub fn unavailable(program: impl Into<String>, reason: impl ToString) -> Self {
        BackupError::CommandUnavailable {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    /// Exit code reported by the tool, when it got far enough to report one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BackupError::CommandFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
