//! Agent configuration: CLI flags plus `PULSETOP_AGENT_*` environment overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::warn;

use crate::cache::CachePolicy;

pub const DEFAULT_PORT: u16 = 3000;
const ENV_PREFIX: &str = "PULSETOP_AGENT_";
const TOP_N_RANGE: std::ops::RangeInclusive<usize> = 30..=50;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub enable_tls: bool,
    pub system_max_age: Duration,
    pub process_max_age: Duration,
    pub system_interval: Duration,
    pub process_interval: Duration,
    pub top_n: usize,
    pub collector_timeout: Duration,
    pub refresh_timeout: Duration,
    pub kill_timeout: Duration,
    // viewer-side bound on the kill round-trip
    pub kill_wait: Duration,
    pub primary_attempts: usize,
    pub session_buffer: usize,
    pub protected: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            enable_tls: false,
            system_max_age: Duration::from_secs(2),
            process_max_age: Duration::from_secs(5),
            system_interval: Duration::from_secs(2),
            process_interval: Duration::from_secs(5),
            top_n: 40,
            collector_timeout: Duration::from_secs(5),
            refresh_timeout: Duration::from_secs(15),
            kill_timeout: Duration::from_secs(5),
            kill_wait: Duration::from_secs(8),
            primary_attempts: 2,
            session_buffer: 16,
            protected: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Build from process args and the real environment.
    pub fn from_env<I: IntoIterator<Item = String>>(args: I) -> Result<Self, String> {
        Self::from_sources(args, |k| std::env::var(k).ok())
    }

    /// `env` looks up a full variable name, e.g. `PULSETOP_AGENT_TOP_N`.
    pub fn from_sources<I, E>(args: I, env: E) -> Result<Self, String>
    where
        I: IntoIterator<Item = String>,
        E: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let lookup = |name: &str| env(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = lookup("PORT") {
            cfg.port = parse_or(&v, "PORT", cfg.port);
        }
        millis(&lookup, "SYSTEM_MAX_AGE_MS", &mut cfg.system_max_age);
        millis(&lookup, "PROCESS_MAX_AGE_MS", &mut cfg.process_max_age);
        millis(&lookup, "SYSTEM_INTERVAL_MS", &mut cfg.system_interval);
        millis(&lookup, "PROCESS_INTERVAL_MS", &mut cfg.process_interval);
        millis(&lookup, "COLLECTOR_TIMEOUT_MS", &mut cfg.collector_timeout);
        millis(&lookup, "REFRESH_TIMEOUT_MS", &mut cfg.refresh_timeout);
        millis(&lookup, "KILL_TIMEOUT_MS", &mut cfg.kill_timeout);
        millis(&lookup, "KILL_WAIT_MS", &mut cfg.kill_wait);
        if let Some(v) = lookup("TOP_N") {
            let n: usize = parse_or(&v, "TOP_N", cfg.top_n);
            cfg.top_n = n.clamp(*TOP_N_RANGE.start(), *TOP_N_RANGE.end());
        }
        if let Some(v) = lookup("PRIMARY_ATTEMPTS") {
            cfg.primary_attempts = parse_or(&v, "PRIMARY_ATTEMPTS", cfg.primary_attempts).max(1);
        }
        if let Some(v) = lookup("SESSION_BUFFER") {
            cfg.session_buffer = parse_or(&v, "SESSION_BUFFER", cfg.session_buffer);
        }
        if let Some(v) = lookup("PROTECTED") {
            cfg.protected = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        // Flags win over the environment.
        let mut it = args.into_iter();
        let prog = it.next().unwrap_or_else(|| "pulsetop_agent".into());
        let mut port: Option<String> = None;
        while let Some(a) = it.next() {
            match a.as_str() {
                "-h" | "--help" => return Err(usage(&prog)),
                "--port" | "-p" => port = it.next(),
                "--bind" | "-b" => {
                    let v = it.next().ok_or_else(|| usage(&prog))?;
                    cfg.bind = v.parse().map_err(|_| format!("invalid bind address: {v}"))?;
                }
                "--enableSSL" | "--enable-ssl" => cfg.enable_tls = true,
                _ if a.starts_with("--port=") => {
                    if let Some((_, v)) = a.split_once('=') {
                        port = Some(v.to_string());
                    }
                }
                _ => return Err(format!("unexpected argument: {a}\n{}", usage(&prog))),
            }
        }
        if let Some(p) = port {
            cfg.port = p.parse().map_err(|_| format!("invalid port: {p}"))?;
        }
        Ok(cfg)
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            system_max_age: self.system_max_age,
            process_max_age: self.process_max_age,
            refresh_timeout: self.refresh_timeout,
        }
    }
}

fn usage(prog: &str) -> String {
    format!("Usage: {prog} [--port PORT|-p PORT] [--bind ADDR|-b ADDR] [--enableSSL]")
}

fn parse_or<T: std::str::FromStr + Copy>(v: &str, name: &str, default: T) -> T {
    match v.trim().parse() {
        Ok(x) => x,
        Err(_) => {
            warn!("ignoring invalid {ENV_PREFIX}{name}={v:?}");
            default
        }
    }
}

fn millis<L: Fn(&str) -> Option<String>>(lookup: &L, name: &str, slot: &mut Duration) {
    if let Some(v) = lookup(name) {
        let ms = parse_or(&v, name, slot.as_millis() as u64);
        *slot = Duration::from_millis(ms.max(1));
    }
}
