//! REST surface: the entity endpoints plus introspection routes.
//!
//! Each entity endpoint is a thin handler over one [`EndpointSpec`]; the
//! dispatcher does everything else. The `type` strings here are the wire
//! contract with running worlds and must not change.

use crate::auth::require_api_key;
use crate::relay::dispatch::{
    dispatch, EndpointSpec, ParamKind, ParamSource, ParamSpec, Rejection,
};
use crate::server::AppState;
use crate::ws;
use axum::extract::{Query, State};
use axum::http::header;
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use worldgate_core::script;

const fn str_param(name: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        source: ParamSource::QueryOrBody,
        kind: ParamKind::Str,
    }
}

const fn bool_param(name: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        source: ParamSource::QueryOrBody,
        kind: ParamKind::Bool,
    }
}

const fn num_param(name: &'static str) -> ParamSpec {
    ParamSpec {
        name,
        source: ParamSource::QueryOrBody,
        kind: ParamKind::Num,
    }
}

const CLIENT_ID: ParamSpec = str_param("clientId");

const DATA: ParamSpec = ParamSpec {
    name: "data",
    source: ParamSource::Body,
    kind: ParamKind::Obj,
};

pub static ENTITY_GET: EndpointSpec = EndpointSpec {
    op: "entity",
    required: &[CLIENT_ID],
    optional: &[str_param("uuid"), bool_param("selected"), bool_param("actor")],
    validate: None,
};

pub static ENTITY_CREATE: EndpointSpec = EndpointSpec {
    op: "create",
    required: &[CLIENT_ID, str_param("entityType"), DATA],
    optional: &[str_param("folder")],
    validate: Some(reject_forbidden_macro),
};

pub static ENTITY_UPDATE: EndpointSpec = EndpointSpec {
    op: "update",
    required: &[CLIENT_ID, DATA],
    optional: &[str_param("uuid"), bool_param("selected"), bool_param("actor")],
    validate: None,
};

pub static ENTITY_DELETE: EndpointSpec = EndpointSpec {
    op: "delete",
    required: &[CLIENT_ID],
    optional: &[str_param("uuid"), bool_param("selected")],
    validate: None,
};

pub static ENTITY_GIVE: EndpointSpec = EndpointSpec {
    op: "give",
    required: &[CLIENT_ID],
    optional: &[
        str_param("fromUuid"),
        str_param("toUuid"),
        bool_param("selected"),
        str_param("itemUuid"),
        str_param("itemName"),
        num_param("quantity"),
    ],
    validate: None,
};

pub static ENTITY_REMOVE: EndpointSpec = EndpointSpec {
    op: "remove",
    required: &[CLIENT_ID],
    optional: &[
        str_param("actorUuid"),
        bool_param("selected"),
        str_param("itemUuid"),
        str_param("itemName"),
        num_param("quantity"),
    ],
    validate: None,
};

pub static ENTITY_INCREASE: EndpointSpec = EndpointSpec {
    op: "increase",
    required: &[CLIENT_ID, str_param("attribute"), num_param("amount")],
    optional: &[str_param("uuid"), bool_param("selected")],
    validate: None,
};

pub static ENTITY_DECREASE: EndpointSpec = EndpointSpec {
    op: "decrease",
    required: &[CLIENT_ID, str_param("attribute"), num_param("amount")],
    optional: &[str_param("uuid"), bool_param("selected")],
    validate: None,
};

pub static ENTITY_KILL: EndpointSpec = EndpointSpec {
    op: "kill",
    required: &[CLIENT_ID],
    optional: &[str_param("uuid"), bool_param("selected")],
    validate: None,
};

/// Macro creations must pass the script guard before anything is sent.
fn reject_forbidden_macro(params: &Map<String, Value>) -> Option<Rejection> {
    if params.get("entityType").and_then(Value::as_str) != Some("Macro") {
        return None;
    }
    let command = params
        .get("data")
        .and_then(|data| data.get("command"))
        .and_then(Value::as_str)?;
    script::forbidden_pattern(command).map(|_| Rejection {
        error: script::FORBIDDEN_SCRIPT_ERROR.to_string(),
        suggestion: Some(script::FORBIDDEN_SCRIPT_SUGGESTION.to_string()),
    })
}

/// Assemble the full application router.
pub fn router(state: AppState) -> Router {
    let entity = Router::new()
        .route("/entity/get", get(entity_get))
        .route("/entity/create", post(entity_create))
        .route("/entity/update", put(entity_update))
        .route("/entity/delete", delete(entity_delete))
        .route("/entity/give", post(entity_give))
        .route("/entity/remove", post(entity_remove))
        .route("/entity/increase", post(entity_increase))
        .route("/entity/decrease", post(entity_decrease))
        .route("/entity/kill", post(entity_kill))
        .route("/clients", get(list_clients))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/", get(ws::ws_upgrade))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .merge(entity)
        .with_state(state)
}

macro_rules! entity_handler {
    ($name:ident, $spec:expr) => {
        async fn $name(
            State(state): State<AppState>,
            Query(query): Query<HashMap<String, String>>,
            body: Option<Json<Value>>,
        ) -> Response {
            let body = body.map(|Json(value)| value);
            dispatch(&state, &$spec, &query, body.as_ref()).await
        }
    };
}

entity_handler!(entity_get, ENTITY_GET);
entity_handler!(entity_create, ENTITY_CREATE);
entity_handler!(entity_update, ENTITY_UPDATE);
entity_handler!(entity_delete, ENTITY_DELETE);
entity_handler!(entity_give, ENTITY_GIVE);
entity_handler!(entity_remove, ENTITY_REMOVE);
entity_handler!(entity_increase, ENTITY_INCREASE);
entity_handler!(entity_decrease, ENTITY_DECREASE);
entity_handler!(entity_kill, ENTITY_KILL);

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connectedWorlds": state.registry.len(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn list_clients(State(state): State<AppState>) -> Json<Value> {
    let clients: Vec<Value> = state
        .registry
        .list()
        .into_iter()
        .map(|info| {
            json!({
                "clientId": info.client_id,
                "idleSecs": info.idle_secs,
                "connectedSecs": info.connected_secs,
            })
        })
        .collect();
    Json(json!({ "clients": clients }))
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn body_json(response: axum::response::Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn entity_routes_require_api_key() {
        let app = router(AppState::for_tests());
        let response = app
            .oneshot(
                Request::get("/entity/get?clientId=W1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], json!("MissingApiKey"));
    }

    #[tokio::test]
    async fn unknown_api_key_is_403() {
        let app = router(AppState::for_tests());
        let response = app
            .oneshot(
                Request::get("/entity/get?clientId=W1")
                    .header("x-api-key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], json!("InvalidApiKey"));
    }

    #[tokio::test]
    async fn keyed_request_reaches_dispatcher() {
        let app = router(AppState::for_tests());
        let response = app
            .oneshot(
                Request::get("/entity/get?clientId=W1&uuid=X")
                    .header("x-api-key", "test-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // Authenticated, but no world is connected.
        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("WorldOffline"));
    }

    #[tokio::test]
    async fn quota_exhaustion_is_429() {
        let mut config = crate::config::ServerConfig::default();
        config.api_keys = vec![crate::config::ApiKeySeed {
            key: "small".into(),
            user_id: "tester".into(),
        }];
        config.daily_quota = 1;
        let app = router(AppState::for_tests_with_config(config));

        let first = app
            .clone()
            .oneshot(
                Request::get("/entity/get?clientId=W1")
                    .header("x-api-key", "small")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);

        let second = app
            .oneshot(
                Request::get("/entity/get?clientId=W1")
                    .header("x-api-key", "small")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let (status, body) = body_json(second).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], json!("QuotaExceeded"));
    }

    #[tokio::test]
    async fn health_and_metrics_are_open() {
        let app = router(AppState::for_tests());

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["connectedWorlds"], json!(0));

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("logs_total"));
    }

    #[tokio::test]
    async fn clients_listing_shows_registered_worlds() {
        let state = AppState::for_tests();
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        state.registry.add("W1", "test-key", tx).await.unwrap();

        let app = router(state);
        let response = app
            .oneshot(
                Request::get("/clients")
                    .header("x-api-key", "test-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let (status, body) = body_json(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["clients"][0]["clientId"], json!("W1"));
    }

    #[test]
    fn macro_guard_only_applies_to_macros() {
        let mut params = Map::new();
        params.insert("entityType".into(), json!("Actor"));
        params.insert("data".into(), json!({"command": "eval('x')"}));
        assert!(reject_forbidden_macro(&params).is_none());

        params.insert("entityType".into(), json!("Macro"));
        let rejection = reject_forbidden_macro(&params).unwrap();
        assert_eq!(rejection.error, script::FORBIDDEN_SCRIPT_ERROR);

        params.insert("data".into(), json!({"command": "game.user.name"}));
        assert!(reject_forbidden_macro(&params).is_none());
    }
}
