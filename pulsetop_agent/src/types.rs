//! Data types sent to viewers over WebSocket.
//! Keep this module minimal and stable; it defines the wire format.
//!
//! Snapshots are only built through `from_raw`, which clamps every numeric
//! field; collectors are allowed to hand us out-of-range values.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::{ProtectionPolicy, RawProcess, RawSystemSample};

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Primary,
    Shell,
    Placeholder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    System,
    Processes,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::System => "system",
            ResourceKind::Processes => "processes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub hostname: String,
    pub cpu_total: f32,
    pub cpu_per_core: Vec<f32>,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_free: u64,
    // one decimal, e.g. "60.0"
    pub used_percent: String,
    pub source: Source,
    pub captured_at: DateTime<Utc>,
}

impl SystemSnapshot {
    pub fn from_raw(raw: RawSystemSample, source: Source) -> Self {
        let mem_total = raw.mem_total;
        let mem_used = raw.mem_used.min(mem_total);
        let mem_free = raw.mem_free.min(mem_total - mem_used);
        Self {
            hostname: raw.hostname,
            cpu_total: clamp_pct(raw.cpu_total),
            cpu_per_core: raw.cpu_per_core.into_iter().map(clamp_pct).collect(),
            mem_total,
            mem_used,
            mem_free,
            used_percent: used_percent(mem_used, mem_total),
            source,
            captured_at: Utc::now(),
        }
    }
}

fn used_percent(used: u64, total: u64) -> String {
    if total == 0 {
        return "0.0".to_string();
    }
    format!("{:.1}", used as f64 / total as f64 * 100.0)
}

/// Clamp into [0, 100]; NaN reads as 0.
pub fn clamp_pct(v: f32) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub cpu_usage: f32,
    pub mem_percent: f32,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub processes: Vec<ProcessEntry>,
    // valid rows seen before truncation to top-N
    pub process_count: usize,
    pub source: Source,
    pub captured_at: DateTime<Utc>,
    // every valid pid seen before truncation, so kill checks reach past top-N
    #[serde(skip)]
    index: HashMap<u32, Indexed>,
}

#[derive(Debug, Clone, PartialEq)]
struct Indexed {
    name: String,
    killable: bool,
}

impl ProcessSnapshot {
    pub fn from_raw(
        raw: Vec<RawProcess>,
        top_n: usize,
        policy: &ProtectionPolicy,
        source: Source,
    ) -> Self {
        let mut seen = HashSet::with_capacity(raw.len());
        let mut processes: Vec<ProcessEntry> = raw
            .into_iter()
            .filter_map(|p| {
                let pid = u32::try_from(p.pid).ok().filter(|&pid| pid > 0 && pid <= i32::MAX as u32)?;
                if !seen.insert(pid) {
                    return None;
                }
                let cpu_usage = if p.cpu_usage.is_nan() {
                    0.0
                } else {
                    p.cpu_usage.max(0.0)
                };
                let killable = match p.killable {
                    Some(false) => false,
                    _ => !policy.is_protected(pid, &p.name),
                };
                Some(ProcessEntry {
                    pid,
                    cpu_usage,
                    mem_percent: clamp_pct(p.mem_percent),
                    user: p.user.unwrap_or_else(|| "?".to_string()),
                    killable: Some(killable),
                    name: p.name,
                })
            })
            .collect();
        let process_count = processes.len();
        let index = processes
            .iter()
            .map(|p| {
                let entry = Indexed {
                    name: p.name.clone(),
                    killable: p.killable != Some(false),
                };
                (p.pid, entry)
            })
            .collect();
        processes.sort_by(|a, b| b.cpu_usage.total_cmp(&a.cpu_usage));
        processes.truncate(top_n);
        Self {
            processes,
            process_count,
            source,
            captured_at: Utc::now(),
            index,
        }
    }

    /// Entry among the top-N rows sent to viewers.
    pub fn find(&self, pid: u32) -> Option<&ProcessEntry> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    /// Whether `pid` was in the full table, including rows cut by top-N.
    pub fn contains(&self, pid: u32) -> bool {
        self.index.contains_key(&pid)
    }

    /// Name of `pid` if the full table marked it non-killable.
    pub fn protected_name(&self, pid: u32) -> Option<&str> {
        self.index
            .get(&pid)
            .filter(|e| !e.killable)
            .map(|e| e.name.as_str())
    }
}

/// Status carried by kill acknowledgments and outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillRequest {
    pub pid: i64,
    pub session: String,
    pub request_id: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillOutcome {
    pub pid: i64,
    pub status: KillStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl KillOutcome {
    pub fn succeeded(pid: i64) -> Self {
        Self {
            pid,
            status: KillStatus::Succeeded,
            reason: None,
        }
    }

    pub fn failed(pid: i64, reason: impl Into<String>) -> Self {
        Self {
            pid,
            status: KillStatus::Failed,
            reason: Some(reason.into()),
        }
    }
}
