//! Stale-while-revalidate snapshot cache with one coalesced refresh per kind.
//!
//! Reads never wait on the collector. A stale read starts a refresh (or joins
//! the one already running) and returns the previous value right away; the
//! refresh replaces the value when it lands. A refresh that fails, times out,
//! or only reaches the placeholder strategy leaves the previous value alone.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, warn};

use crate::fallback::{FallbackChain, Fetched};
use crate::types::{ProcessSnapshot, ResourceKind, Source, SystemSnapshot};

type RefreshFuture = Shared<BoxFuture<'static, bool>>;

#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub system_max_age: Duration,
    pub process_max_age: Duration,
    // outer bound on one refresh, on top of the per-call collector timeout
    pub refresh_timeout: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            system_max_age: Duration::from_secs(2),
            process_max_age: Duration::from_secs(5),
            refresh_timeout: Duration::from_secs(15),
        }
    }
}

/// A cached value as handed to readers.
#[derive(Debug)]
pub struct Cached<T> {
    pub value: Arc<T>,
    pub version: u64,
    pub age: Duration,
}

impl<T> Clone for Cached<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            version: self.version,
            age: self.age,
        }
    }
}

struct CacheEntry<T> {
    value: Option<Arc<T>>,
    last_fetched_at: Option<Instant>,
    version: u64,
    in_flight: Option<RefreshFuture>,
}

struct Slot<T> {
    kind: ResourceKind,
    entry: Mutex<CacheEntry<T>>,
}

impl<T: Send + Sync + 'static> Slot<T> {
    fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            entry: Mutex::new(CacheEntry {
                value: None,
                last_fetched_at: None,
                version: 0,
                in_flight: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheEntry<T>> {
        self.entry.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn read(&self) -> Option<Cached<T>> {
        let entry = self.lock();
        let value = entry.value.clone()?;
        Some(Cached {
            value,
            version: entry.version,
            age: entry
                .last_fetched_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX),
        })
    }

    fn is_stale(&self, max_age: Duration) -> bool {
        let entry = self.lock();
        match (&entry.value, entry.last_fetched_at) {
            (Some(_), Some(at)) => at.elapsed() > max_age,
            _ => true,
        }
    }

    fn in_flight(&self) -> Option<RefreshFuture> {
        self.lock().in_flight.clone()
    }

    /// Join the running refresh, or start one. The refresh is driven by its
    /// own task, so dropping the returned future never cancels it.
    fn start_or_join<F>(self: &Arc<Self>, fetch: F, limit: Duration) -> RefreshFuture
    where
        F: FnOnce() -> BoxFuture<'static, Fetched<T>>,
    {
        let mut entry = self.lock();
        if let Some(running) = &entry.in_flight {
            debug!(kind = self.kind.as_str(), "joining in-flight refresh");
            return running.clone();
        }
        let slot = Arc::clone(self);
        let work = fetch();
        let refresh = async move {
            let result = timeout(limit, work).await;
            slot.complete(result, limit)
        }
        .boxed()
        .shared();
        entry.in_flight = Some(refresh.clone());
        drop(entry);
        tokio::spawn(refresh.clone());
        refresh
    }

    fn complete(&self, result: Result<Fetched<T>, Elapsed>, limit: Duration) -> bool {
        let mut entry = self.lock();
        entry.in_flight = None;
        let kind = self.kind.as_str();
        match result {
            Err(_) => {
                warn!("{kind} refresh timed out after {limit:?}; keeping previous snapshot");
                false
            }
            Ok(fetched) if fetched.source == Source::Placeholder && entry.value.is_some() => {
                warn!(
                    failures = fetched.attempts.len(),
                    "every {kind} source failed; keeping previous snapshot"
                );
                false
            }
            Ok(fetched) => {
                entry.value = Some(Arc::new(fetched.value));
                entry.last_fetched_at = Some(Instant::now());
                entry.version += 1;
                true
            }
        }
    }
}

/// Owned, injectable snapshot cache. Constructed once per agent and shared
/// through `Arc` with the hub, the samplers and the kill pipeline.
pub struct SampleCache {
    chain: Arc<FallbackChain>,
    policy: CachePolicy,
    system: Arc<Slot<SystemSnapshot>>,
    processes: Arc<Slot<ProcessSnapshot>>,
}

impl SampleCache {
    pub fn new(chain: FallbackChain, policy: CachePolicy) -> Self {
        Self {
            chain: Arc::new(chain),
            policy,
            system: Arc::new(Slot::new(ResourceKind::System)),
            processes: Arc::new(Slot::new(ResourceKind::Processes)),
        }
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    fn max_age(&self, kind: ResourceKind) -> Duration {
        match kind {
            ResourceKind::System => self.policy.system_max_age,
            ResourceKind::Processes => self.policy.process_max_age,
        }
    }

    /// Current system snapshot under the configured max age. Must be called
    /// from within a tokio runtime (a stale read spawns the refresh).
    pub fn system(&self) -> Option<Cached<SystemSnapshot>> {
        self.get_system(self.policy.system_max_age)
    }

    pub fn processes(&self) -> Option<Cached<ProcessSnapshot>> {
        self.get_processes(self.policy.process_max_age)
    }

    pub fn get_system(&self, max_age: Duration) -> Option<Cached<SystemSnapshot>> {
        if self.system.is_stale(max_age) {
            let _ = self.start(ResourceKind::System);
        }
        self.system.read()
    }

    pub fn get_processes(&self, max_age: Duration) -> Option<Cached<ProcessSnapshot>> {
        if self.processes.is_stale(max_age) {
            let _ = self.start(ResourceKind::Processes);
        }
        self.processes.read()
    }

    /// Read without triggering a refresh.
    pub fn peek_system(&self) -> Option<Cached<SystemSnapshot>> {
        self.system.read()
    }

    pub fn peek_processes(&self) -> Option<Cached<ProcessSnapshot>> {
        self.processes.read()
    }

    pub fn version(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::System => self.system.lock().version,
            ResourceKind::Processes => self.processes.lock().version,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.system.lock().value.is_some() && self.processes.lock().value.is_some()
    }

    /// Join or start a refresh and wait for it. Returns whether the cached
    /// value was replaced.
    pub async fn refresh(&self, kind: ResourceKind) -> bool {
        self.start(kind).await
    }

    /// Refresh only if the value is older than its max age.
    pub async fn refresh_if_stale(&self, kind: ResourceKind) -> bool {
        let max_age = self.max_age(kind);
        let stale = match kind {
            ResourceKind::System => self.system.is_stale(max_age),
            ResourceKind::Processes => self.processes.is_stale(max_age),
        };
        if stale {
            self.refresh(kind).await
        } else {
            false
        }
    }

    /// Refresh regardless of age. A refresh already running may have sampled
    /// before the caller's side effect, so wait it out and then fetch again.
    pub async fn force_refresh(&self, kind: ResourceKind) -> bool {
        let running = match kind {
            ResourceKind::System => self.system.in_flight(),
            ResourceKind::Processes => self.processes.in_flight(),
        };
        if let Some(running) = running {
            running.await;
        }
        self.refresh(kind).await
    }

    /// First fetch of both kinds, so the first viewer never sees an empty cache.
    pub async fn prime(&self) {
        futures::join!(
            self.refresh(ResourceKind::System),
            self.refresh(ResourceKind::Processes)
        );
    }

    fn start(&self, kind: ResourceKind) -> RefreshFuture {
        let chain = Arc::clone(&self.chain);
        let limit = self.policy.refresh_timeout;
        match kind {
            ResourceKind::System => self
                .system
                .start_or_join(move || async move { chain.fetch_system().await }.boxed(), limit),
            ResourceKind::Processes => self.processes.start_or_join(
                move || async move { chain.fetch_processes().await }.boxed(),
                limit,
            ),
        }
    }
}
