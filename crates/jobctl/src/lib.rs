//! jobctl - POSIX command execution and job control
//!
//! Spawns commands and pipelines into dedicated process groups, hands the
//! controlling terminal to the foreground group, and waits for completion
//! without ever blocking the embedding host's own event processing.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ JobControl (facade)                           │
//! │   execute / execute_pipeline / send_* / jobs  │
//! └──────┬─────────────────┬───────────────┬──────┘
//!        │                 │               │
//!  ┌─────▼──────┐   ┌──────▼──────┐  ┌─────▼──────────┐
//!  │  JobTable  │   │ Coordinator │  │ wait/drain loop│◄── EventHook
//!  │ (no I/O)   │   │ (terminal)  │  │ (polling only) │
//!  └────────────┘   └─────────────┘  └────────────────┘
//! ```
//!
//! Reaping is done exclusively by non-blocking `waitpid` polling; no
//! `SIGCHLD` handler is installed.

pub mod capture;
pub mod child;
pub mod command;
pub mod config;
pub mod control;
pub mod execute;
pub mod job_table;
pub mod multiwatch;
pub mod terminal;
pub mod types;
pub mod wait;

pub use capture::{CaptureBuffer, CapturedOutput, Completion};
pub use command::{CommandSpec, RedirectDirection, Redirection};
pub use config::JobControlConfig;
pub use control::JobControl;
pub use job_table::JobTable;
pub use multiwatch::{MultiWatch, WatchUpdate};
pub use terminal::{Coordinator, TerminalOwnership};
pub use types::{ChildStatus, JobEvent, JobEventKind, JobId, JobSummary, ProcessRecord, ProcessState};
pub use wait::{EventHook, ForegroundJob, ForegroundSignals};

// ============================================================================
// Error Types with Structured Codes
// ============================================================================

/// Error codes for job-control operations (for machine-readable errors)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum JobErrorCode {
    /// Generic IO error
    Io = 5000,
    /// Pipe or fork could not be created
    SpawnFailed = 5001,
    /// Background table is at capacity
    TableFull = 5002,
    /// No foreground job registered
    NoForegroundJob = 5003,
    /// No controlling terminal, or the shell is not in the foreground
    NoControllingTerminal = 5004,
    /// A running foreground job is still registered
    AlreadyOccupied = 5005,
    /// No background job with that id
    JobNotFound = 5006,
    /// Empty argument vector or interior NUL byte
    InvalidCommand = 5007,
    /// kill/killpg failed
    Signal = 5008,
    /// Configuration could not be read or is invalid
    Config = 5009,
}

/// Custom error type for job-control operations
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("[{code}] IO error: {message}")]
    Io { code: u32, message: String },

    #[error("[{code}] Failed to spawn: {message}")]
    SpawnFailed { code: u32, message: String },

    #[error("[{code}] Job table full: {message}")]
    TableFull { code: u32, message: String },

    #[error("[{code}] No foreground job: {message}")]
    NoForegroundJob { code: u32, message: String },

    #[error("[{code}] No controlling terminal: {message}")]
    NoControllingTerminal { code: u32, message: String },

    #[error("[{code}] Foreground already occupied: {message}")]
    AlreadyOccupied { code: u32, message: String },

    #[error("[{code}] Job not found: {message}")]
    JobNotFound { code: u32, message: String },

    #[error("[{code}] Invalid command: {message}")]
    InvalidCommand { code: u32, message: String },

    #[error("[{code}] Signal delivery failed: {message}")]
    Signal { code: u32, message: String },

    #[error("[{code}] Configuration error: {message}")]
    Config { code: u32, message: String },
}

impl JobError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            code: JobErrorCode::Io as u32,
            message: message.into(),
        }
    }

    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            code: JobErrorCode::SpawnFailed as u32,
            message: message.into(),
        }
    }

    pub fn table_full(message: impl Into<String>) -> Self {
        Self::TableFull {
            code: JobErrorCode::TableFull as u32,
            message: message.into(),
        }
    }

    pub fn no_foreground_job(message: impl Into<String>) -> Self {
        Self::NoForegroundJob {
            code: JobErrorCode::NoForegroundJob as u32,
            message: message.into(),
        }
    }

    pub fn no_controlling_terminal(message: impl Into<String>) -> Self {
        Self::NoControllingTerminal {
            code: JobErrorCode::NoControllingTerminal as u32,
            message: message.into(),
        }
    }

    pub fn already_occupied(message: impl Into<String>) -> Self {
        Self::AlreadyOccupied {
            code: JobErrorCode::AlreadyOccupied as u32,
            message: message.into(),
        }
    }

    pub fn job_not_found(message: impl Into<String>) -> Self {
        Self::JobNotFound {
            code: JobErrorCode::JobNotFound as u32,
            message: message.into(),
        }
    }

    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::InvalidCommand {
            code: JobErrorCode::InvalidCommand as u32,
            message: message.into(),
        }
    }

    pub fn signal(message: impl Into<String>) -> Self {
        Self::Signal {
            code: JobErrorCode::Signal as u32,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            code: JobErrorCode::Config as u32,
            message: message.into(),
        }
    }

    /// Numeric code of this error.
    pub fn code(&self) -> u32 {
        match self {
            Self::Io { code, .. }
            | Self::SpawnFailed { code, .. }
            | Self::TableFull { code, .. }
            | Self::NoForegroundJob { code, .. }
            | Self::NoControllingTerminal { code, .. }
            | Self::AlreadyOccupied { code, .. }
            | Self::JobNotFound { code, .. }
            | Self::InvalidCommand { code, .. }
            | Self::Signal { code, .. }
            | Self::Config { code, .. } => *code,
        }
    }

    /// Conditions callers are expected to shrug off and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoForegroundJob { .. } | Self::NoControllingTerminal { .. }
        )
    }
}

impl From<std::io::Error> for JobError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<nix::Error> for JobError {
    fn from(e: nix::Error) -> Self {
        Self::io(e.desc())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = JobError::spawn_failed("fork");
        match err {
            JobError::SpawnFailed { code, .. } => {
                assert_eq!(code, JobErrorCode::SpawnFailed as u32);
            }
            _ => panic!("Wrong error type"),
        }

        let err = JobError::table_full("100 jobs");
        assert_eq!(err.code(), JobErrorCode::TableFull as u32);
        assert_eq!(err.to_string(), "[5002] Job table full: 100 jobs");
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(JobError::no_foreground_job("x").is_recoverable());
        assert!(JobError::no_controlling_terminal("x").is_recoverable());
        assert!(!JobError::spawn_failed("x").is_recoverable());
        assert!(!JobError::table_full("x").is_recoverable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: JobError = io.into();
        assert_eq!(err.code(), JobErrorCode::Io as u32);
    }
}
