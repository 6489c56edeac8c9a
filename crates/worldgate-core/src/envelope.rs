//! JSON wire envelope exchanged with game worlds.
//!
//! Wire format (UTF-8 text frames):
//!
//! - Request: `{"type": "<op>", "requestId": "<uuid>", "clientId": "<world>", ...payload}`
//! - Response: `{"type": "<op>-result", "requestId": "<uuid>", ...payload}` or
//!   `{"type": "<op>-result", "requestId": "<uuid>", "error": "<msg>"}`
//!
//! The broker never interprets payload fields; they ride in the flattened map.

use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single message on the world WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Operation name (`entity`, `create`, ...) or its `-result` twin.
    #[serde(rename = "type")]
    pub kind: String,
    /// Correlation token, echoed verbatim by the world. Absent on
    /// unsolicited world-push events.
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Target world identity. Only set on request envelopes.
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// World-reported failure for this request, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// All remaining fields, passed through untouched.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build a request envelope for `op` targeting `client_id`.
    pub fn request(
        op: &str,
        request_id: &str,
        client_id: &str,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            kind: op.to_string(),
            request_id: Some(request_id.to_string()),
            client_id: Some(client_id.to_string()),
            error: None,
            payload,
        }
    }

    /// Build a successful `<op>-result` reply (used by tests and fixtures;
    /// real replies come from the worlds themselves).
    pub fn reply(op: &str, request_id: &str, payload: Map<String, Value>) -> Self {
        Self {
            kind: format!("{op}-result"),
            request_id: Some(request_id.to_string()),
            client_id: None,
            error: None,
            payload,
        }
    }

    /// Build an error `<op>-result` reply.
    pub fn error_reply(op: &str, request_id: &str, message: &str) -> Self {
        Self {
            kind: format!("{op}-result"),
            request_id: Some(request_id.to_string()),
            client_id: None,
            error: Some(message.to_string()),
            payload: Map::new(),
        }
    }

    /// True when the world reported a failure for this request.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serialize to a UTF-8 text frame.
    pub fn to_text(&self) -> GateResult<String> {
        serde_json::to_string(self).map_err(|e| GateError::MalformedFrame(e.to_string()))
    }

    /// Parse an inbound text frame.
    ///
    /// Fails with [`GateError::MalformedFrame`] on invalid JSON or a
    /// missing/empty `type` field; the caller drops the frame and logs.
    pub fn from_text(text: &str) -> GateResult<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| GateError::MalformedFrame(e.to_string()))?;
        if envelope.kind.is_empty() {
            return Err(GateError::MalformedFrame("empty type field".into()));
        }
        Ok(envelope)
    }
}
