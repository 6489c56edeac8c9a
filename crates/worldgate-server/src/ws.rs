//! World-facing WebSocket lifecycle.
//!
//! Handshake: the root upgrade URL with `id` and `token` query params.
//! Missing or invalid credentials close the socket with 1008. A valid
//! handshake registers the session; after that a writer task owns the
//! sink (serializing all outbound frames) and the inbound pump reads
//! frames, feeds the correlator, and answers the ping schedule.

use crate::relay::{correlate, FailureKind};
use crate::server::AppState;
use crate::session::{CloseReason, OutboundFrame, Session, CLOSE_POLICY_VIOLATION};
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Protocol-level ping payload.
const PING_PAYLOAD: &[u8] = b"keepalive";

/// Outbound queue depth per session.
const OUTBOUND_BUFFER: usize = 64;

/// `GET /?id=<world>&token=<credential>` upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let id = params.get("id").cloned();
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, state, id, token))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: AppState,
    id: Option<String>,
    token: Option<String>,
) {
    let (Some(id), Some(token)) = (id, token) else {
        close_with(&mut socket, CLOSE_POLICY_VIOLATION, "missing id or token").await;
        return;
    };

    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (session, superseded) = match state.registry.add(&id, &token, out_tx).await {
        Ok(added) => added,
        Err(rejected) => {
            close_with(&mut socket, CLOSE_POLICY_VIOLATION, rejected.as_str()).await;
            return;
        }
    };

    // The old connection's in-flight requests cannot be answered through
    // it anymore; fail them now rather than letting them ride to timeout.
    if let Some(old) = superseded {
        let failed = state
            .pending
            .fail_for_session(old.conn_id(), FailureKind::SessionLost);
        if failed > 0 {
            state.telemetry.warn(
                "failed in-flight requests of superseded connection",
                json!({"clientId": id, "count": failed}),
            );
        }
    }

    state
        .metrics
        .connected_worlds
        .set(state.registry.len() as i64);
    state
        .telemetry
        .info("world connected", json!({"clientId": id}));

    run_session(socket, &state, &session, out_rx).await;
}

/// Drive one registered session until it closes from either side.
async fn run_session(
    socket: WebSocket,
    state: &AppState,
    session: &Arc<Session>,
    mut out_rx: mpsc::Receiver<OutboundFrame>,
) {
    let (mut sink, mut stream) = socket.split();

    // Writer task: sole owner of the sink. Ends when a close frame is
    // sent or every outbound sender is gone.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text.into()),
                OutboundFrame::Ping => Message::Ping(Bytes::from_static(PING_PAYLOAD)),
                OutboundFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Inbound pump: frames, pings, and external close in one loop.
    let cancel = session.cancel_token();
    let mut ping = tokio::time::interval(state.config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,
            _ = ping.tick() => {
                if session.send_ping().await.is_err() {
                    break Some(CloseReason::TransportError);
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    correlate(state, session, text.as_str());
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                    // axum answers pings itself; both count as liveness.
                    session.touch();
                }
                Some(Ok(Message::Binary(_))) => {
                    session.touch();
                    state.telemetry.warn(
                        "dropping non-text frame",
                        json!({"clientId": session.client_id()}),
                    );
                }
                Some(Ok(Message::Close(_))) | None => break Some(CloseReason::PeerClosed),
                Some(Err(e)) => {
                    debug!(client_id = %session.client_id(), error = %e, "read failed");
                    break Some(CloseReason::TransportError);
                }
            }
        }
    };

    teardown(state, session, reason);
    // The writer drains the queued close frame and exits once the last
    // outbound sender (the session handle itself) is dropped.
    drop(writer);
}

/// Close-path cleanup; safe to run after an external closer already did
/// part of the work.
fn teardown(state: &AppState, session: &Arc<Session>, reason: Option<CloseReason>) {
    if let Some(reason) = reason {
        session.close(reason);
        state.telemetry.info(
            "world disconnected",
            json!({"clientId": session.client_id(), "reason": reason.as_str()}),
        );
    }
    state.registry.remove(session.client_id(), session);
    state
        .pending
        .fail_for_session(session.conn_id(), FailureKind::SessionLost);
    state
        .metrics
        .connected_worlds
        .set(state.registry.len() as i64);
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    debug!(code, reason, "refusing world connection");
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
