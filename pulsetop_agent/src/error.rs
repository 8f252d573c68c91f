//! Error types for collection and process control.
//!
//! Nothing here is fatal to the agent: collector errors are recovered by the
//! fallback chain and kill errors are reported back to the requesting viewer.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectorError {
    #[error("collector unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("shell enumeration failed: {0}")]
    Shell(String),
    #[error("no usable rows in command output ({skipped} malformed lines skipped)")]
    Parse { skipped: usize },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KillError {
    // the pid as the viewer wrote it
    #[error("invalid pid {0}")]
    InvalidPid(String),
    #[error("process {pid} ({name}) is protected")]
    Protected { pid: u32, name: String },
    #[error("process not found: {0}")]
    NotFound(u32),
    #[error("process {0} already exited")]
    AlreadyExited(u32),
    #[error("permission denied for process {0}")]
    PermissionDenied(u32),
    #[error("timeout")]
    Timeout,
    #[error("{0}")]
    Platform(String),
}

impl KillError {
    /// Errors meaning the target does not exist; the process table is stale.
    pub fn is_gone(&self) -> bool {
        matches!(self, KillError::NotFound(_) | KillError::AlreadyExited(_))
    }
}
