//! The dispatcher: the single helper every REST endpoint goes through.
//!
//! Turns one HTTP request into one request envelope and back: extract and
//! coerce parameters against the endpoint's schema, resolve the target
//! session, mint the request id, register the waiter, send, await, and
//! translate the outcome to an HTTP response. This is the only place
//! request ids are minted and timeouts armed, so waiters cannot leak.

use crate::relay::{PendingRequests, WaitOutcome};
use crate::server::AppState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use worldgate_core::Envelope;

/// Where a parameter is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Query,
    Body,
    QueryOrBody,
}

/// Expected parameter type. Coercion is strict: a present value that does
/// not match its kind rejects the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Num,
    Bool,
    Obj,
}

impl ParamKind {
    fn as_str(self) -> &'static str {
        match self {
            ParamKind::Str => "string",
            ParamKind::Num => "number",
            ParamKind::Bool => "boolean",
            ParamKind::Obj => "object",
        }
    }
}

/// One parameter in an endpoint schema.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub source: ParamSource,
    pub kind: ParamKind,
}

/// Endpoint-supplied rejection from the validate hook.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub error: String,
    pub suggestion: Option<String>,
}

/// Pure validation hook over the extracted parameters.
pub type ValidateFn = fn(&Map<String, Value>) -> Option<Rejection>;

/// Static description of one REST endpoint.
pub struct EndpointSpec {
    /// Operation name placed in the outbound envelope's `type` field.
    pub op: &'static str,
    pub required: &'static [ParamSpec],
    pub optional: &'static [ParamSpec],
    pub validate: Option<ValidateFn>,
}

/// Relay one HTTP request to its target world and translate the reply.
pub async fn dispatch(
    state: &AppState,
    spec: &EndpointSpec,
    query: &HashMap<String, String>,
    body: Option<&Value>,
) -> Response {
    // 1. Extract and coerce parameters against the schema.
    let params = match extract_params(spec, query, body) {
        Ok(params) => params,
        Err(response) => return response,
    };

    // 2. Endpoint-specific validation.
    if let Some(validate) = spec.validate {
        if let Some(rejection) = validate(&params) {
            return error_response(
                StatusCode::BAD_REQUEST,
                &rejection.error,
                rejection.suggestion.as_deref(),
            );
        }
    }

    // 3. Resolve the target world.
    let client_id = params
        .get("clientId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let Some(session) = state.registry.get(&client_id) else {
        state.telemetry.warn(
            "dispatch to offline world",
            json!({"clientId": client_id, "op": spec.op}),
        );
        return error_response(StatusCode::NOT_FOUND, "WorldOffline", None);
    };

    // 4. Mint the request id and arm the waiter.
    let request_id = PendingRequests::new_request_id();
    let waiter = state.pending.register(&request_id, session.conn_id());

    // 5. Send the envelope; the payload is every extracted param except
    //    the routing key.
    let mut payload = params;
    payload.remove("clientId");
    let envelope = Envelope::request(spec.op, &request_id, &client_id, payload);
    if let Err(e) = session.send(&envelope).await {
        state.telemetry.warn(
            "upstream send failed",
            json!({"clientId": client_id, "op": spec.op, "error": e.to_string()}),
        );
        // The waiter drops here, freeing its slot.
        return error_response(StatusCode::BAD_GATEWAY, "UpstreamSendFailed", None);
    }
    state.metrics.relayed_total.inc();

    // 6. Await exactly one outcome.
    match waiter.await_reply(state.config.request_timeout).await {
        WaitOutcome::Reply(reply) => {
            if let Some(message) = reply.error {
                let suggestion = reply
                    .payload
                    .get("suggestion")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                error_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    &message,
                    suggestion.as_deref(),
                )
            } else {
                (StatusCode::OK, Json(Value::Object(reply.payload))).into_response()
            }
        }
        WaitOutcome::Timeout => {
            state.telemetry.warn(
                "upstream timeout",
                json!({"clientId": client_id, "op": spec.op, "requestId": request_id}),
            );
            error_response(StatusCode::GATEWAY_TIMEOUT, "UpstreamTimeout", None)
        }
        WaitOutcome::SessionLost => {
            state.telemetry.warn(
                "world disconnected mid-request",
                json!({"clientId": client_id, "op": spec.op, "requestId": request_id}),
            );
            error_response(StatusCode::BAD_GATEWAY, "WorldDisconnected", None)
        }
        WaitOutcome::Cancelled => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "BrokerShuttingDown", None)
        }
    }
}

/// Build the standard machine-readable error body.
pub fn error_response(status: StatusCode, error: &str, suggestion: Option<&str>) -> Response {
    let mut body = json!({ "error": error });
    if let Some(suggestion) = suggestion {
        body["suggestion"] = json!(suggestion);
    }
    (status, Json(body)).into_response()
}

/// Extract all schema parameters from the query string and JSON body.
fn extract_params(
    spec: &EndpointSpec,
    query: &HashMap<String, String>,
    body: Option<&Value>,
) -> Result<Map<String, Value>, Response> {
    let mut params = Map::new();

    for param in spec.required {
        match lookup(param, query, body)? {
            Some(value) => {
                params.insert(param.name.to_string(), value);
            }
            None => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "MissingParameter",
                    Some(&format!("supply the '{}' parameter", param.name)),
                ));
            }
        }
    }

    for param in spec.optional {
        if let Some(value) = lookup(param, query, body)? {
            params.insert(param.name.to_string(), value);
        }
    }

    Ok(params)
}

/// Find one parameter in its configured source(s). Absent is `Ok(None)`;
/// present with the wrong type is a 400.
fn lookup(
    param: &ParamSpec,
    query: &HashMap<String, String>,
    body: Option<&Value>,
) -> Result<Option<Value>, Response> {
    if matches!(param.source, ParamSource::Query | ParamSource::QueryOrBody) {
        if let Some(raw) = query.get(param.name) {
            return coerce_query(raw, param.kind)
                .map(Some)
                .ok_or_else(|| type_mismatch(param));
        }
    }
    if matches!(param.source, ParamSource::Body | ParamSource::QueryOrBody) {
        if let Some(value) = body
            .and_then(Value::as_object)
            .and_then(|map| map.get(param.name))
        {
            return check_body_kind(value, param.kind)
                .map(Some)
                .ok_or_else(|| type_mismatch(param));
        }
    }
    Ok(None)
}

fn type_mismatch(param: &ParamSpec) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        "TypeMismatch",
        Some(&format!(
            "'{}' must be a {}",
            param.name,
            param.kind.as_str()
        )),
    )
}

/// Coerce a query-string value to its declared kind.
fn coerce_query(raw: &str, kind: ParamKind) -> Option<Value> {
    match kind {
        ParamKind::Str => Some(Value::String(raw.to_string())),
        ParamKind::Num => {
            if let Ok(n) = raw.parse::<i64>() {
                Some(json!(n))
            } else {
                raw.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| json!(f))
            }
        }
        ParamKind::Bool => match raw {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        ParamKind::Obj => serde_json::from_str::<Value>(raw)
            .ok()
            .filter(Value::is_object),
    }
}

/// Check a body value against its declared kind; body values are already
/// typed JSON, so no parsing happens here.
fn check_body_kind(value: &Value, kind: ParamKind) -> Option<Value> {
    let matches = match kind {
        ParamKind::Str => value.is_string(),
        ParamKind::Num => value.is_number(),
        ParamKind::Bool => value.is_boolean(),
        ParamKind::Obj => value.is_object(),
    };
    matches.then(|| value.clone())
}
