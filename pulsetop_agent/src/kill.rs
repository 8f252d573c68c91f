//! Process termination: validation, the platform kill call, and the forced
//! process-table refresh that follows it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::KillError;
use crate::hub::BroadcastHub;
use crate::types::{KillOutcome, KillRequest, ResourceKind};

/// Forcefully terminates a single pid.
#[async_trait]
pub trait Terminator: Send + Sync {
    async fn terminate(&self, pid: u32) -> Result<(), KillError>;
}

/// SIGKILL on unix, `taskkill /F` on Windows.
pub struct PlatformTerminator;

#[cfg(unix)]
#[async_trait]
impl Terminator for PlatformTerminator {
    async fn terminate(&self, pid: u32) -> Result<(), KillError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| KillError::InvalidPid(pid.to_string()))?;
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(KillError::NotFound(pid)),
            Err(Errno::EPERM) => Err(KillError::PermissionDenied(pid)),
            Err(e) => Err(KillError::Platform(e.desc().to_string())),
        }
    }
}

#[cfg(windows)]
#[async_trait]
impl Terminator for PlatformTerminator {
    async fn terminate(&self, pid: u32) -> Result<(), KillError> {
        let out = tokio::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| KillError::Platform(format!("taskkill: {e}")))?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr).to_lowercase();
        if stderr.contains("not found") {
            Err(KillError::NotFound(pid))
        } else if stderr.contains("access is denied") {
            Err(KillError::PermissionDenied(pid))
        } else {
            Err(KillError::Platform(stderr.trim().to_string()))
        }
    }
}

pub struct KillPipeline {
    hub: Arc<BroadcastHub>,
    terminator: Arc<dyn Terminator>,
    call_timeout: Duration,
}

impl KillPipeline {
    pub fn new(hub: Arc<BroadcastHub>, terminator: Arc<dyn Terminator>, call_timeout: Duration) -> Self {
        Self {
            hub,
            terminator,
            call_timeout,
        }
    }

    /// Run one kill request to its terminal outcome. Never returns `Pending`.
    pub async fn kill(&self, req: &KillRequest) -> KillOutcome {
        match self.execute(req).await {
            Ok(()) => {
                info!(pid = req.pid, session = %req.session, "process terminated");
                KillOutcome::succeeded(req.pid)
            }
            Err(e) => {
                // Rejections are the viewer's business, not a service fault.
                info!(pid = req.pid, session = %req.session, "kill failed: {e}");
                KillOutcome::failed(req.pid, e.to_string())
            }
        }
    }

    async fn execute(&self, req: &KillRequest) -> Result<(), KillError> {
        let pid = validate_pid(req.pid)?;
        let cache = self.hub.cache();
        let policy = cache.chain().policy();
        if policy.is_protected_pid(pid) {
            return Err(KillError::Protected {
                pid,
                name: "system".into(),
            });
        }
        let snapshot = cache.peek_processes();
        if let Some(name) = snapshot.as_ref().and_then(|c| c.value.protected_name(pid)) {
            return Err(KillError::Protected {
                pid,
                name: name.to_string(),
            });
        }
        let known = snapshot.is_some_and(|c| c.value.contains(pid));

        let result = match timeout(self.call_timeout, self.terminator.terminate(pid)).await {
            Ok(r) => r,
            Err(_) => {
                warn!(pid, "kill call timed out after {:?}", self.call_timeout);
                return Err(KillError::Timeout);
            }
        };

        // Whatever the platform said, the table we hold about this pid is now suspect.
        cache.force_refresh(ResourceKind::Processes).await;
        self.hub.broadcast(ResourceKind::Processes);

        match result {
            Err(e) if e.is_gone() && known => Err(KillError::AlreadyExited(pid)),
            other => other,
        }
    }
}

/// Accept only a JSON integer; `"42"`, `12.5` and anything past i64 are rejected.
pub fn parse_pid(raw: &Value) -> Result<i64, KillError> {
    raw.as_i64().ok_or_else(|| KillError::InvalidPid(raw.to_string()))
}

fn validate_pid(pid: i64) -> Result<u32, KillError> {
    match u32::try_from(pid) {
        Ok(p) if p >= 1 && pid <= i64::from(i32::MAX) => Ok(p),
        _ => Err(KillError::InvalidPid(pid.to_string())),
    }
}
