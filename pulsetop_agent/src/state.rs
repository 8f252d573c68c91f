//! Shared agent state: the snapshot cache, the broadcast hub and the kill pipeline.

use std::sync::Arc;

use crate::cache::SampleCache;
use crate::collector::{ProtectionPolicy, SystemCollector};
use crate::config::AgentConfig;
use crate::fallback::{FallbackChain, ShellEnumeration};
use crate::hub::BroadcastHub;
use crate::kill::{KillPipeline, PlatformTerminator, Terminator};
use crate::metrics::SysinfoCollector;

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SampleCache>,
    pub hub: Arc<BroadcastHub>,
    pub kill: Arc<KillPipeline>,
    pub config: Arc<AgentConfig>,
}

impl AppState {
    /// Production wiring: sysinfo, the platform shell, the platform kill call.
    pub fn new(config: AgentConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(SysinfoCollector::new()),
            Some(ShellEnumeration::platform()),
            Arc::new(PlatformTerminator),
        )
    }

    pub fn with_parts(
        config: AgentConfig,
        collector: Arc<dyn SystemCollector>,
        shell: Option<ShellEnumeration>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        let chain = FallbackChain::new(
            collector,
            shell,
            ProtectionPolicy::new(config.protected.iter().cloned()),
        )
        .with_primary_attempts(config.primary_attempts)
        .with_call_timeout(config.collector_timeout)
        .with_top_n(config.top_n);
        let cache = Arc::new(SampleCache::new(chain, config.cache_policy()));
        let hub = Arc::new(BroadcastHub::new(Arc::clone(&cache), config.session_buffer));
        let kill = Arc::new(KillPipeline::new(
            Arc::clone(&hub),
            terminator,
            config.kill_timeout,
        ));
        Self {
            cache,
            hub,
            kill,
            config: Arc::new(config),
        }
    }
}
