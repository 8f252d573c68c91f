//! Metrics collection using sysinfo for pulsetop_agent.

use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};
use tracing::{debug, warn};

use crate::collector::{RawProcess, RawSystemSample, SystemCollector};
use crate::error::CollectorError;

// Unknown uids trigger a user-list reload at most this often.
const USERS_RELOAD_EVERY: Duration = Duration::from_secs(30);

struct Table {
    sys: System,
    users: Users,
    users_loaded_at: Instant,
}

impl Table {
    // New accounts appear after startup; reload when a uid has no name yet.
    fn reload_users_if_missing(&mut self) {
        if self.users_loaded_at.elapsed() < USERS_RELOAD_EVERY {
            return;
        }
        let users = &self.users;
        let missing = self
            .sys
            .processes()
            .values()
            .filter_map(|p| p.user_id())
            .any(|uid| users.get_user_by_id(uid).is_none());
        if missing {
            debug!("unknown uid in process table, reloading users");
            self.users.refresh();
            self.users_loaded_at = Instant::now();
        }
    }
}

/// Production collector. Keeps the sysinfo handles alive across refreshes so
/// CPU usage is computed from deltas between consecutive samples. System and
/// process-table sampling use separate handles and never wait on each other.
#[derive(Clone)]
pub struct SysinfoCollector {
    system: Arc<Mutex<System>>,
    table: Arc<Mutex<Table>>,
    hostname: String,
}

impl Default for SysinfoCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let hostname = hostname::get()
            .ok()
            .and_then(|s| s.into_string().ok())
            .or_else(System::host_name)
            .unwrap_or_else(|| "unknown".into());
        Self {
            system: Arc::new(Mutex::new(sys)),
            table: Arc::new(Mutex::new(Table {
                sys: System::new(),
                users: Users::new_with_refreshed_list(),
                users_loaded_at: Instant::now(),
            })),
            hostname,
        }
    }
}

// sysinfo blocks on /proc walks; keep it off the async workers. A call that
// timed out upstream may still hold the handles: report busy instead of
// queueing another blocking task behind it.
async fn blocking<H, T, F>(handles: &Arc<Mutex<H>>, f: F) -> Result<T, CollectorError>
where
    H: Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut H) -> T + Send + 'static,
{
    let handles = Arc::clone(handles);
    tokio::task::spawn_blocking(move || {
        let mut guard = match handles.try_lock() {
            Ok(guard) => guard,
            // A panic mid-refresh leaves the handles usable; the next refresh overwrites them.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(CollectorError::Unavailable(
                    "previous sysinfo refresh still running".into(),
                ))
            }
        };
        Ok(f(&mut guard))
    })
    .await
    .map_err(|e| {
        warn!("sysinfo refresh panicked: {e:?}");
        CollectorError::Unavailable(format!("sysinfo task failed: {e}"))
    })?
}

#[async_trait]
impl SystemCollector for SysinfoCollector {
    async fn system(&self) -> Result<RawSystemSample, CollectorError> {
        let hostname = self.hostname.clone();
        blocking(&self.system, move |sys| {
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            let mem_total = sys.total_memory();
            let available = sys.available_memory();
            RawSystemSample {
                hostname,
                cpu_total: sys.global_cpu_usage(),
                cpu_per_core: sys.cpus().iter().map(|c| c.cpu_usage()).collect(),
                mem_total,
                mem_used: mem_total.saturating_sub(available),
                mem_free: available,
            }
        })
        .await
    }

    async fn processes(&self) -> Result<Vec<RawProcess>, CollectorError> {
        let procs = blocking(&self.table, |t| {
            t.sys.refresh_memory();
            t.sys.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing()
                    .with_cpu()
                    .with_memory()
                    .with_user(UpdateKind::OnlyIfNotSet),
            );
            t.reload_users_if_missing();
            let mem_total = t.sys.total_memory().max(1) as f64;
            let users = &t.users;
            t.sys
                .processes()
                .values()
                .map(|p| RawProcess {
                    pid: i64::from(p.pid().as_u32()),
                    name: p.name().to_string_lossy().into_owned(),
                    cpu_usage: p.cpu_usage(),
                    mem_percent: (p.memory() as f64 / mem_total * 100.0) as f32,
                    user: p
                        .user_id()
                        .and_then(|uid| users.get_user_by_id(uid))
                        .map(|u| u.name().to_string()),
                    killable: None,
                })
                .collect::<Vec<_>>()
        })
        .await?;
        if procs.is_empty() {
            return Err(CollectorError::Unavailable(
                "sysinfo returned an empty process table".into(),
            ));
        }
        Ok(procs)
    }
}
