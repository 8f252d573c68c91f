//! WebSocket upgrade and per-connection viewer session.
//!
//! A session registers with the hub, forwards hub frames to its socket, and
//! turns kill requests into an acknowledgment followed by exactly one outcome.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::{BroadcastHub, SessionId};
use crate::kill::parse_pid;
use crate::proto::{ClientEvent, ServerEvent};
use crate::state::AppState;
use crate::types::{KillOutcome, KillRequest, KillStatus};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// Deregisters on every exit path, including a panic in the reader loop.
struct SessionGuard {
    hub: Arc<BroadcastHub>,
    id: SessionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session, mut outbound) = state.hub.register();
    let _guard = SessionGuard {
        hub: Arc::clone(&state.hub),
        id: session,
    };
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Work owned by this viewer only; aborted on disconnect.
    let mut pending = JoinSet::new();

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(session = %session, "socket error: {e}");
                break;
            }
        };
        match msg {
            Message::Text(text) => match ClientEvent::parse(&text) {
                Ok(ClientEvent::Kill { pid, request_id }) => {
                    pending.spawn(kill_round_trip(state.clone(), session, pid, request_id));
                }
                Ok(ClientEvent::Refresh { kind }) => {
                    let hub = Arc::clone(&state.hub);
                    pending.spawn(async move {
                        hub.deliver_fresh(session, kind).await;
                    });
                }
                Err(e) => debug!(session = %session, "ignoring unparsable message: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
        while pending.try_join_next().is_some() {}
    }

    pending.abort_all();
    writer.abort();
}

/// Acknowledge, run the pipeline with a bounded wait, report the outcome.
/// The pipeline runs in its own task: a timeout here ends the viewer's wait,
/// not the kill or the refresh behind it.
async fn kill_round_trip(
    state: AppState,
    session: SessionId,
    raw_pid: Value,
    request_id: Option<String>,
) {
    let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let hub = &state.hub;

    send(hub, session, &ServerEvent::KillAck {
        request_id: &request_id,
        pid: &raw_pid,
    })
    .await;

    let pid = match parse_pid(&raw_pid) {
        Ok(pid) => pid,
        Err(e) => {
            info!(session = %session, "kill rejected: {e}");
            let reason = e.to_string();
            send(hub, session, &ServerEvent::KillOutcome {
                request_id: &request_id,
                pid: &raw_pid,
                status: KillStatus::Failed,
                reason: Some(&reason),
            })
            .await;
            return;
        }
    };

    let req = KillRequest {
        pid,
        session: session.to_string(),
        request_id: request_id.clone(),
        requested_at: Utc::now(),
    };
    let pipeline = Arc::clone(&state.kill);
    let job = tokio::spawn(async move { pipeline.kill(&req).await });

    let outcome = match timeout(state.config.kill_wait, job).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(pid, "kill task failed: {e}");
            KillOutcome::failed(pid, "internal error")
        }
        Err(_) => KillOutcome::failed(pid, "timeout waiting for kill outcome"),
    };
    send(hub, session, &ServerEvent::kill_outcome(&request_id, &raw_pid, &outcome)).await;
}

async fn send(hub: &BroadcastHub, session: SessionId, event: &ServerEvent<'_>) {
    match event.to_frame() {
        Ok(frame) => {
            hub.send_to(session, frame).await;
        }
        Err(e) => warn!("failed to encode event: {e}"),
    }
}
