//! Request relay: pending-request table, correlator, and dispatcher.

pub mod dispatch;
pub mod pending;

pub use dispatch::{dispatch, EndpointSpec, ParamKind, ParamSource, ParamSpec, Rejection};
pub use pending::{FailureKind, PendingRequests, WaitOutcome, Waiter};

use crate::server::AppState;
use crate::session::Session;
use serde_json::json;
use tracing::debug;
use worldgate_core::Envelope;

/// Sink for unsolicited world-push events (frames without a `requestId`).
/// Broadcast fan-out lives behind this seam; the broker core only counts
/// and logs.
pub trait PushSink: Send + Sync {
    fn deliver(&self, client_id: &str, envelope: Envelope);
}

/// Default push sink: log at debug and drop.
pub struct LoggingPushSink;

impl PushSink for LoggingPushSink {
    fn deliver(&self, client_id: &str, envelope: Envelope) {
        debug!(client_id, kind = %envelope.kind, "world push event dropped (no sink configured)");
    }
}

/// Correlator entry point, called by a session's inbound pump for every
/// text frame.
///
/// A reply is matched purely by `requestId`, independent of which session
/// delivered it; this tolerates a world reconnecting between request and
/// response. Frames without a `requestId` are world-push events and go to
/// the push sink.
pub fn correlate(state: &AppState, session: &Session, text: &str) {
    let envelope = match Envelope::from_text(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            state.telemetry.warn(
                "dropping malformed frame",
                json!({"clientId": session.client_id(), "error": e.to_string()}),
            );
            return;
        }
    };

    match envelope.request_id.clone() {
        Some(request_id) => {
            if !state.pending.complete(&request_id, envelope) {
                state.telemetry.warn(
                    "reply for unknown request id",
                    json!({"clientId": session.client_id(), "requestId": request_id}),
                );
            }
        }
        None => {
            state.metrics.pushes_total.inc();
            state.push_sink.deliver(session.client_id(), envelope);
        }
    }
}
