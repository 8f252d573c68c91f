//! Fallback chain: primary collector, then shell enumeration, then a
//! placeholder, tried in order until one produces a snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::collector::{ProtectionPolicy, RawProcess, RawSystemSample, SystemCollector};
use crate::error::CollectorError;
use crate::types::{ProcessSnapshot, Source, SystemSnapshot};

const PROCESS_STRATEGIES: &[Source] = &[Source::Primary, Source::Shell, Source::Placeholder];
const SYSTEM_STRATEGIES: &[Source] = &[Source::Primary, Source::Placeholder];

// Far above any real pid_max, so a placeholder row can never alias a live process.
const PLACEHOLDER_PIDS: [i64; 2] = [i32::MAX as i64 - 1, i32::MAX as i64];

/// One failed strategy attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub strategy: Source,
    pub error: CollectorError,
}

/// A snapshot together with the strategy that produced it and the failures before it.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub source: Source,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFamily {
    Unix,
    Windows,
}

impl ShellFamily {
    pub fn current() -> Self {
        if cfg!(windows) {
            ShellFamily::Windows
        } else {
            ShellFamily::Unix
        }
    }

    fn command(self) -> (&'static str, &'static [&'static str]) {
        match self {
            ShellFamily::Unix => ("ps", &["-axo", "pid=,pcpu=,pmem=,user=,comm="]),
            ShellFamily::Windows => ("tasklist", &["/FO", "CSV", "/NH"]),
        }
    }

    pub fn parse(self, output: &str) -> ParseReport {
        match self {
            ShellFamily::Unix => parse_ps_output(output),
            ShellFamily::Windows => parse_tasklist_output(output),
        }
    }
}

/// Runs an external command and returns its stdout.
#[async_trait]
pub trait ShellRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CollectorError>;
}

pub struct TokioShell;

#[async_trait]
impl ShellRunner for TokioShell {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CollectorError> {
        let out = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CollectorError::Shell(format!("{program}: {e}")))?;
        if !out.status.success() {
            return Err(CollectorError::Shell(format!(
                "{program} exited with {}",
                out.status
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParseReport {
    pub entries: Vec<RawProcess>,
    pub skipped: usize,
}

impl ParseReport {
    fn push(&mut self, line: &str, parsed: Option<RawProcess>) {
        match parsed {
            Some(p) => self.entries.push(p),
            None => {
                debug!("skipping malformed process line: {line:?}");
                self.skipped += 1;
            }
        }
    }
}

/// `ps -axo pid=,pcpu=,pmem=,user=,comm=`: five whitespace-separated
/// columns, the command name may itself contain spaces.
pub fn parse_ps_output(output: &str) -> ParseReport {
    let mut report = ParseReport::default();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        report.push(line, parse_ps_line(line));
    }
    report
}

fn parse_ps_line(line: &str) -> Option<RawProcess> {
    let mut it = line.split_whitespace();
    let pid = it.next()?.parse::<i64>().ok().filter(|&p| p > 0)?;
    let cpu = it.next()?.parse::<f32>().ok()?;
    let mem = it.next()?.parse::<f32>().ok()?;
    let user = it.next()?.to_string();
    let name = it.collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return None;
    }
    // comm is a full path on BSD/macOS; kernel threads keep their slashes
    let name = match name.strip_prefix('/') {
        Some(path) => path.rsplit('/').next().unwrap_or(path).to_string(),
        None => name,
    };
    Some(RawProcess {
        pid,
        name,
        cpu_usage: cpu,
        mem_percent: mem,
        user: Some(user),
        killable: None,
    })
}

/// `tasklist /FO CSV /NH`: `"name","pid","session","session#","mem K"`.
/// tasklist reports no CPU or memory share, so both read as zero.
pub fn parse_tasklist_output(output: &str) -> ParseReport {
    let mut report = ParseReport::default();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        report.push(line, parse_tasklist_line(line));
    }
    report
}

fn parse_tasklist_line(line: &str) -> Option<RawProcess> {
    let inner = line.trim().strip_prefix('"')?.strip_suffix('"')?;
    let fields: Vec<&str> = inner.split("\",\"").collect();
    if fields.len() < 5 || fields[0].is_empty() {
        return None;
    }
    let pid = fields[1].parse::<i64>().ok().filter(|&p| p > 0)?;
    Some(RawProcess {
        pid,
        name: fields[0].to_string(),
        cpu_usage: 0.0,
        mem_percent: 0.0,
        user: None,
        killable: None,
    })
}

/// Shell strategy configuration: how to run commands and which layout to parse.
pub struct ShellEnumeration {
    pub runner: Arc<dyn ShellRunner>,
    pub family: ShellFamily,
}

impl ShellEnumeration {
    pub fn platform() -> Self {
        Self {
            runner: Arc::new(TokioShell),
            family: ShellFamily::current(),
        }
    }
}

pub struct FallbackChain {
    collector: Arc<dyn SystemCollector>,
    shell: Option<ShellEnumeration>,
    policy: ProtectionPolicy,
    primary_attempts: usize,
    call_timeout: Duration,
    top_n: usize,
}

impl FallbackChain {
    pub fn new(
        collector: Arc<dyn SystemCollector>,
        shell: Option<ShellEnumeration>,
        policy: ProtectionPolicy,
    ) -> Self {
        Self {
            collector,
            shell,
            policy,
            primary_attempts: 2,
            call_timeout: Duration::from_secs(5),
            top_n: 40,
        }
    }

    pub fn with_primary_attempts(mut self, n: usize) -> Self {
        self.primary_attempts = n.max(1);
        self
    }

    pub fn with_call_timeout(mut self, d: Duration) -> Self {
        self.call_timeout = d;
        self
    }

    pub fn with_top_n(mut self, n: usize) -> Self {
        self.top_n = n;
        self
    }

    pub fn policy(&self) -> &ProtectionPolicy {
        &self.policy
    }

    pub async fn fetch_system(&self) -> Fetched<SystemSnapshot> {
        let mut attempts = Vec::new();
        for &strategy in SYSTEM_STRATEGIES {
            let result = match strategy {
                Source::Primary => {
                    self.primary("system", || self.collector.system(), &mut attempts)
                        .await
                }
                Source::Shell => continue,
                Source::Placeholder => break,
            };
            match result {
                Ok(raw) => {
                    return Fetched {
                        value: SystemSnapshot::from_raw(raw, strategy),
                        source: strategy,
                        attempts,
                    }
                }
                Err(error) => record(&mut attempts, "system", strategy, error),
            }
        }
        Fetched {
            value: SystemSnapshot::from_raw(placeholder_system(), Source::Placeholder),
            source: Source::Placeholder,
            attempts,
        }
    }

    pub async fn fetch_processes(&self) -> Fetched<ProcessSnapshot> {
        let mut attempts = Vec::new();
        for &strategy in PROCESS_STRATEGIES {
            let result = match strategy {
                Source::Primary => {
                    self.primary("processes", || self.collector.processes(), &mut attempts)
                        .await
                }
                Source::Shell => self.shell_processes().await,
                Source::Placeholder => break,
            };
            match result {
                Ok(raw) => {
                    return Fetched {
                        value: ProcessSnapshot::from_raw(raw, self.top_n, &self.policy, strategy),
                        source: strategy,
                        attempts,
                    }
                }
                Err(error) => record(&mut attempts, "processes", strategy, error),
            }
        }
        Fetched {
            value: ProcessSnapshot::from_raw(
                placeholder_processes(),
                self.top_n,
                &self.policy,
                Source::Placeholder,
            ),
            source: Source::Placeholder,
            attempts,
        }
    }

    // Primary gets `primary_attempts` tries. Every failure but the last is
    // recorded here; the caller records the last one.
    async fn primary<T, F, Fut>(
        &self,
        what: &str,
        call: F,
        attempts: &mut Vec<Attempt>,
    ) -> Result<T, CollectorError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, CollectorError>>,
    {
        let mut last = None;
        for _ in 0..self.primary_attempts {
            if let Some(e) = last.take() {
                record(attempts, what, Source::Primary, e);
            }
            match timeout(self.call_timeout, call()).await {
                Ok(Ok(v)) => return Ok(v),
                Ok(Err(e)) => last = Some(e),
                Err(_) => last = Some(CollectorError::Timeout(self.call_timeout)),
            }
        }
        Err(last.unwrap_or_else(|| CollectorError::Unavailable("no attempt made".into())))
    }

    async fn shell_processes(&self) -> Result<Vec<RawProcess>, CollectorError> {
        let Some(shell) = &self.shell else {
            return Err(CollectorError::Shell("shell enumeration disabled".into()));
        };
        let (program, args) = shell.family.command();
        let output = timeout(self.call_timeout, shell.runner.run(program, args))
            .await
            .map_err(|_| CollectorError::Timeout(self.call_timeout))??;
        let report = shell.family.parse(&output);
        if report.skipped > 0 {
            debug!(skipped = report.skipped, "{program} output had malformed lines");
        }
        if report.entries.is_empty() {
            return Err(CollectorError::Parse {
                skipped: report.skipped,
            });
        }
        Ok(report.entries)
    }
}

fn record(attempts: &mut Vec<Attempt>, what: &str, strategy: Source, error: CollectorError) {
    warn!(?strategy, "{what} collection failed, falling back: {error}");
    attempts.push(Attempt { strategy, error });
}

fn placeholder_system() -> RawSystemSample {
    RawSystemSample {
        hostname: "unavailable".into(),
        ..RawSystemSample::default()
    }
}

fn placeholder_processes() -> Vec<RawProcess> {
    [
        "(placeholder) process data unavailable",
        "(placeholder) retrying collection",
    ]
    .into_iter()
    .zip(PLACEHOLDER_PIDS)
    .map(|(name, pid)| RawProcess {
        pid,
        name: name.into(),
        cpu_usage: 0.0,
        mem_percent: 0.0,
        user: Some("-".into()),
        killable: Some(false),
    })
    .collect()
}
