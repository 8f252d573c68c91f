//! WebSocket event protocol. Every frame is one JSON text message:
//! viewer-bound events are `{"type": ..., "data": ...}`, viewer requests are
//! flat objects tagged by `type`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{KillOutcome, KillStatus, ProcessSnapshot, ResourceKind, SystemSnapshot};

/// A serialized event, shared by every session it is delivered to.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent<'a> {
    System(&'a SystemSnapshot),
    Processes(&'a ProcessSnapshot),
    // pid is echoed exactly as the viewer sent it, valid or not
    KillAck {
        request_id: &'a str,
        pid: &'a Value,
    },
    KillOutcome {
        request_id: &'a str,
        pid: &'a Value,
        status: KillStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'a str>,
    },
}

impl<'a> ServerEvent<'a> {
    pub fn kill_outcome(request_id: &'a str, pid: &'a Value, outcome: &'a KillOutcome) -> Self {
        ServerEvent::KillOutcome {
            request_id,
            pid,
            status: outcome.status,
            reason: outcome.reason.as_deref(),
        }
    }

    pub fn to_frame(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Kill {
        // any JSON value; a non-integer still gets a failed outcome
        pid: Value,
        #[serde(default)]
        request_id: Option<String>,
    },
    Refresh {
        kind: ResourceKind,
    },
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
