use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use pentest_common::{Event, EventKind, Phase};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::api::SharedState;
use crate::sink::Subscription;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

/// Live payloads pushed to the subscribers of one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Mirror of a persisted [`Event`].
    AgentLog {
        target_id: i64,
        phase: Phase,
        log_type: EventKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scan_job_id: Option<i64>,
    },
    /// Pipeline transition; never persisted.
    PhaseUpdate {
        target_id: i64,
        phase: String,
        message: String,
    },
}

impl WsMessage {
    pub fn from_event(event: &Event) -> Self {
        Self::AgentLog {
            target_id: event.target_id,
            phase: event.phase,
            log_type: event.kind,
            message: event.message.clone(),
            scan_job_id: event.job_id,
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(target_id): Path<i64>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    // Subscribe before the upgrade completes so nothing emitted in between is missed.
    let subscription = state.runtime.sink.subscribe(target_id);
    ws.on_upgrade(move |socket| handle_socket(socket, subscription))
}

async fn handle_socket(socket: WebSocket, subscription: Subscription) {
    let target_id = subscription.target_id();
    debug!(target_id, "websocket connected");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, subscription).await;
    debug!(target_id, "websocket closed");
}

/// Forward live messages to one socket with ping/pong keepalive.
///
/// Exits when the client closes, a send fails, no Pong arrives within
/// [`PONG_TIMEOUT`] of a Ping, or the sink drops the subscription.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: Subscription,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            msg = subscription.recv() => {
                match msg {
                    Some(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────
