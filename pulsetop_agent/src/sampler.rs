//! Background samplers: one cadence per resource kind, shared by every viewer.
//! Each tick reads through the cache and lets the hub broadcast what changed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::trace;

use crate::hub::BroadcastHub;
use crate::types::ResourceKind;

// 2s default: cpu/mem
pub fn spawn_sampler(hub: Arc<BroadcastHub>, period: Duration) -> JoinHandle<()> {
    spawn_cadence(hub, ResourceKind::System, period)
}

// 5s default: process table (enumeration is costlier)
pub fn spawn_process_sampler(hub: Arc<BroadcastHub>, period: Duration) -> JoinHandle<()> {
    spawn_cadence(hub, ResourceKind::Processes, period)
}

fn spawn_cadence(hub: Arc<BroadcastHub>, kind: ResourceKind, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            // With nobody watching, tick() returns without touching the collector.
            let reached = hub.tick(kind);
            trace!(kind = kind.as_str(), reached, "cadence tick");
        }
    })
}
