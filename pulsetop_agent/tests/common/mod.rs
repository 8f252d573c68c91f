//! Fakes shared by the integration tests: a scriptable collector, a canned
//! shell, and a terminator that records what it was asked to kill.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pulsetop_agent::collector::{RawProcess, RawSystemSample, SystemCollector};
use pulsetop_agent::config::AgentConfig;
use pulsetop_agent::error::{CollectorError, KillError};
use pulsetop_agent::fallback::{ShellEnumeration, ShellFamily, ShellRunner};
use pulsetop_agent::kill::Terminator;
use pulsetop_agent::state::AppState;

pub fn proc(pid: i64, name: &str, cpu: f32) -> RawProcess {
    RawProcess {
        pid,
        name: name.into(),
        cpu_usage: cpu,
        mem_percent: 1.0,
        user: Some("tester".into()),
        killable: None,
    }
}

pub fn sample(cpu: f32) -> RawSystemSample {
    RawSystemSample {
        hostname: "testhost".into(),
        cpu_total: cpu,
        cpu_per_core: vec![cpu, cpu],
        mem_total: 1000,
        mem_used: 600,
        mem_free: 400,
    }
}

#[derive(Default)]
pub struct FakeCollector {
    pub system: Mutex<RawSystemSample>,
    pub table: Mutex<Vec<RawProcess>>,
    // number of upcoming calls that fail, per kind
    pub fail_system: AtomicUsize,
    pub fail_processes: AtomicUsize,
    pub broken: AtomicBool,
    pub delay: Mutex<Duration>,
    pub system_calls: AtomicUsize,
    pub process_calls: AtomicUsize,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl FakeCollector {
    pub fn new(system: RawSystemSample, table: Vec<RawProcess>) -> Arc<Self> {
        Arc::new(Self {
            system: Mutex::new(system),
            table: Mutex::new(table),
            ..Self::default()
        })
    }

    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock().unwrap() = d;
    }

    pub fn remove(&self, pid: i64) {
        self.table.lock().unwrap().retain(|p| p.pid != pid);
    }

    async fn enter(&self) -> Result<(), CollectorError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(CollectorError::Unavailable("fake collector is broken".into()));
        }
        Ok(())
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl SystemCollector for FakeCollector {
    async fn system(&self) -> Result<RawSystemSample, CollectorError> {
        self.system_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        if take_failure(&self.fail_system) {
            return Err(CollectorError::Unavailable("scripted system failure".into()));
        }
        Ok(self.system.lock().unwrap().clone())
    }

    async fn processes(&self) -> Result<Vec<RawProcess>, CollectorError> {
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        if take_failure(&self.fail_processes) {
            return Err(CollectorError::Unavailable("scripted process failure".into()));
        }
        Ok(self.table.lock().unwrap().clone())
    }
}

pub struct CannedShell {
    pub output: Result<String, CollectorError>,
    pub calls: AtomicUsize,
}

impl CannedShell {
    pub fn ok(output: &str) -> Arc<Self> {
        Arc::new(Self {
            output: Ok(output.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            output: Err(CollectorError::Shell("ps: not installed".into())),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ShellRunner for CannedShell {
    async fn run(&self, _program: &str, _args: &[&str]) -> Result<String, CollectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output.clone()
    }
}

pub fn unix_shell(runner: Arc<CannedShell>) -> ShellEnumeration {
    ShellEnumeration {
        runner,
        family: ShellFamily::Unix,
    }
}

/// Terminator that removes the pid from a fake collector's table, or fails
/// with a scripted error.
pub struct FakeTerminator {
    pub collector: Arc<FakeCollector>,
    pub error: Mutex<Option<KillError>>,
    pub hang: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<u32>>,
}

impl FakeTerminator {
    pub fn new(collector: Arc<FakeCollector>) -> Arc<Self> {
        Arc::new(Self {
            collector,
            error: Mutex::new(None),
            hang: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_with(&self, e: KillError) {
        *self.error.lock().unwrap() = Some(e);
    }

    pub fn hang_for(&self, d: Duration) {
        *self.hang.lock().unwrap() = Some(d);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Terminator for FakeTerminator {
    async fn terminate(&self, pid: u32) -> Result<(), KillError> {
        self.calls.lock().unwrap().push(pid);
        let hang = *self.hang.lock().unwrap();
        if let Some(d) = hang {
            tokio::time::sleep(d).await;
        }
        if let Some(e) = self.error.lock().unwrap().clone() {
            return Err(e);
        }
        self.collector.remove(i64::from(pid));
        Ok(())
    }
}

pub fn test_config() -> AgentConfig {
    AgentConfig {
        collector_timeout: Duration::from_millis(500),
        refresh_timeout: Duration::from_secs(2),
        kill_timeout: Duration::from_millis(500),
        kill_wait: Duration::from_secs(2),
        primary_attempts: 2,
        ..AgentConfig::default()
    }
}

pub fn state_with(
    config: AgentConfig,
    collector: Arc<FakeCollector>,
    shell: Option<ShellEnumeration>,
    terminator: Arc<FakeTerminator>,
) -> AppState {
    AppState::with_parts(config, collector, shell, terminator)
}

pub fn default_table() -> Vec<RawProcess> {
    vec![
        proc(100, "worker", 12.0),
        proc(200, "idle", 0.5),
        proc(300, "busy", 80.0),
        proc(1, "systemd", 0.1),
    ]
}
