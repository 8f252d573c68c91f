//! The collector capability: raw CPU/memory samples and raw process tables.
//!
//! Raw values are untrusted; `types::*::from_raw` clamps them into snapshots.

use std::collections::HashSet;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use crate::error::CollectorError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSystemSample {
    pub hostname: String,
    pub cpu_total: f32,
    pub cpu_per_core: Vec<f32>,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_free: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawProcess {
    pub pid: i64,
    pub name: String,
    pub cpu_usage: f32,
    pub mem_percent: f32,
    pub user: Option<String>,
    // a source may already know a process is off-limits
    pub killable: Option<bool>,
}

#[async_trait]
pub trait SystemCollector: Send + Sync {
    async fn system(&self) -> Result<RawSystemSample, CollectorError>;
    async fn processes(&self) -> Result<Vec<RawProcess>, CollectorError>;
}

// Killing any of these takes the session or the whole host down with it.
static CRITICAL_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "systemd",
        "init",
        "kthreadd",
        "Xorg",
        "Xwayland",
        "kwin_wayland",
        "kwin_x11",
        "plasmashell",
        "gnome-shell",
        "sddm",
        "gdm",
        "dbus-daemon",
        "polkitd",
        "systemd-logind",
        "pipewire",
        "wireplumber",
        "launchd",
        "kernel_task",
        "WindowServer",
        "System",
        "smss.exe",
        "csrss.exe",
        "wininit.exe",
        "winlogon.exe",
        "services.exe",
        "lsass.exe",
    ]
    .into_iter()
    .collect()
});

/// Decides which processes are reported as non-killable.
#[derive(Debug, Clone)]
pub struct ProtectionPolicy {
    self_pid: u32,
    extra_names: HashSet<String>,
}

impl Default for ProtectionPolicy {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl ProtectionPolicy {
    pub fn new<I, S>(extra_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            self_pid: std::process::id(),
            extra_names: extra_names.into_iter().map(Into::into).collect(),
        }
    }

    /// pid 1 and the agent itself are protected regardless of name.
    pub fn is_protected_pid(&self, pid: u32) -> bool {
        pid == 1 || pid == self.self_pid
    }

    pub fn is_protected(&self, pid: u32, name: &str) -> bool {
        self.is_protected_pid(pid)
            || CRITICAL_NAMES.contains(name)
            || self.extra_names.contains(name)
    }
}
