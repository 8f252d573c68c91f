//! Broadcast hub: fans cached snapshots out to every connected viewer.
//!
//! Each snapshot is serialized once and the same frame is queued on every
//! session's bounded channel with `try_send`. A viewer whose queue is full
//! misses that frame; nobody waits on a slow viewer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::SampleCache;
use crate::proto::{Frame, ServerEvent};
use crate::types::ResourceKind;

pub type SessionId = Uuid;

const KINDS: [ResourceKind; 2] = [ResourceKind::System, ResourceKind::Processes];

pub struct BroadcastHub {
    cache: Arc<SampleCache>,
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<Frame>>>,
    // last version fanned out per kind; the cadence skips unchanged snapshots
    delivered: Mutex<HashMap<ResourceKind, u64>>,
    buffer: usize,
}

impl BroadcastHub {
    pub fn new(cache: Arc<SampleCache>, buffer: usize) -> Self {
        Self {
            cache,
            sessions: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
            // room for the two connect-time snapshots plus kill replies
            buffer: buffer.max(4),
        }
    }

    pub fn cache(&self) -> &Arc<SampleCache> {
        &self.cache
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::Sender<Frame>>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a viewer and queue whatever is cached right now, stale or not.
    /// The registry stays locked until the first frames are queued, so a
    /// concurrent fan-out lands after them and is never missed.
    pub fn register(&self) -> (SessionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        let viewers = {
            let mut sessions = self.sessions();
            for kind in KINDS {
                if let Some((_, frame)) = self.frame(kind, true) {
                    let _ = tx.try_send(frame);
                }
            }
            sessions.insert(id, tx);
            sessions.len()
        };
        info!(session = %id, viewers, "viewer connected");
        (id, rx)
    }

    pub fn deregister(&self, id: SessionId) {
        let removed = self.sessions().remove(&id).is_some();
        if removed {
            info!(session = %id, viewers = self.session_count(), "viewer disconnected");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Outbound queue of one session, if it is still registered.
    pub fn sender(&self, id: SessionId) -> Option<mpsc::Sender<Frame>> {
        self.sessions().get(&id).cloned()
    }

    /// One cadence step for `kind`: read through the cache (which refreshes
    /// in the background when stale) and fan out if the snapshot changed
    /// since the last broadcast. Returns the number of sessions reached.
    pub fn tick(&self, kind: ResourceKind) -> usize {
        if self.session_count() == 0 {
            return 0;
        }
        let Some((version, frame)) = self.frame(kind, true) else {
            return 0;
        };
        {
            let mut delivered = self.delivered.lock().unwrap_or_else(|p| p.into_inner());
            let last = delivered.entry(kind).or_insert(0);
            if *last >= version {
                return 0;
            }
            *last = version;
        }
        self.fan_out(kind, frame)
    }

    /// Push the cached snapshot of `kind` to everyone now, changed or not.
    pub fn broadcast(&self, kind: ResourceKind) -> usize {
        let Some((version, frame)) = self.frame(kind, false) else {
            return 0;
        };
        {
            let mut delivered = self.delivered.lock().unwrap_or_else(|p| p.into_inner());
            let last = delivered.entry(kind).or_insert(0);
            *last = (*last).max(version);
        }
        self.fan_out(kind, frame)
    }

    /// Serve an explicit refresh request from one viewer: refresh if stale,
    /// then send the current snapshot to that viewer only.
    pub async fn deliver_fresh(&self, id: SessionId, kind: ResourceKind) -> bool {
        self.cache.refresh_if_stale(kind).await;
        let Some((_, frame)) = self.frame(kind, false) else {
            return false;
        };
        self.send_to(id, frame).await
    }

    /// Queue a frame for one session. Nothing is sent once it has deregistered.
    pub async fn send_to(&self, id: SessionId, frame: Frame) -> bool {
        match self.sender(id) {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }

    fn frame(&self, kind: ResourceKind, revalidate: bool) -> Option<(u64, Frame)> {
        let encoded = match kind {
            ResourceKind::System => {
                let cached = if revalidate {
                    self.cache.system()
                } else {
                    self.cache.peek_system()
                }?;
                ServerEvent::System(&cached.value)
                    .to_frame()
                    .map(|f| (cached.version, f))
            }
            ResourceKind::Processes => {
                let cached = if revalidate {
                    self.cache.processes()
                } else {
                    self.cache.peek_processes()
                }?;
                ServerEvent::Processes(&cached.value)
                    .to_frame()
                    .map(|f| (cached.version, f))
            }
        };
        match encoded {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("failed to encode {} snapshot: {e}", kind.as_str());
                None
            }
        }
    }

    fn fan_out(&self, kind: ResourceKind, frame: Frame) -> usize {
        let mut sessions = self.sessions();
        let mut reached = 0;
        sessions.retain(|id, tx| match tx.try_send(Frame::clone(&frame)) {
            Ok(()) => {
                reached += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(session = %id, "viewer queue full, dropping {} frame", kind.as_str());
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session = %id, "viewer channel closed, deregistering");
                false
            }
        });
        reached
    }
}
