//! Credential and quota adapter.
//!
//! The broker consumes credentials through the [`CredentialStore`] trait:
//! world handshake validation, API-key authorization with a daily quota,
//! and the bulk counter reset. The in-memory implementation keeps key
//! digests only; raw keys never persist past construction.

pub mod reset;

pub use reset::{MemoryResetLock, ResetLock};

use crate::config::{ApiKeySeed, ServerConfig};
use crate::relay::dispatch::error_response;
use crate::server::AppState;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use rand::Rng;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// The authenticated REST caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthorizedUser {
    pub user_id: String,
    pub requests_today: u32,
    pub daily_quota: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("unknown api key")]
    UnknownKey,
    #[error("daily quota exceeded")]
    QuotaExceeded,
    #[error("credential backend unavailable: {0}")]
    Backend(String),
}

/// Pluggable credential and quota provider.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Validate a world handshake (`id` + `token` query params).
    async fn validate_headless_session(&self, client_id: &str, token: &str) -> bool;

    /// Authorize one REST request: check the key, roll the daily window,
    /// enforce the quota, and count the request.
    async fn authorize(&self, api_key: &str) -> Result<AuthorizedUser, AuthError>;

    /// Zero every key's daily counter. Returns how many records changed.
    async fn reset_daily_counters(&self) -> Result<u64, AuthError>;
}

/// Days since the Unix epoch; the daily-quota window boundary (UTC).
pub fn current_day() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / 86_400)
        .unwrap_or(0)
}

#[derive(Debug)]
struct CredentialRecord {
    user_id: String,
    requests_today: u32,
    daily_quota: u32,
    last_request_day: u64,
}

/// In-memory credential store keyed by `sha256` digest of the API key.
pub struct MemoryCredentialStore {
    records: DashMap<String, CredentialRecord>,
}

impl MemoryCredentialStore {
    pub fn from_seeds(seeds: &[ApiKeySeed], daily_quota: u32) -> Self {
        let records = DashMap::new();
        for seed in seeds {
            records.insert(
                digest(&seed.key),
                CredentialRecord {
                    user_id: seed.user_id.clone(),
                    requests_today: 0,
                    daily_quota,
                    last_request_day: 0,
                },
            );
        }
        Self { records }
    }

    /// Build from config; when no keys are seeded, generates an ephemeral
    /// development key and returns it so startup can log it once.
    pub fn from_config(config: &ServerConfig) -> (Self, Option<String>) {
        if config.api_keys.is_empty() {
            let key = generate_api_key();
            let store = Self::from_seeds(
                &[ApiKeySeed {
                    key: key.clone(),
                    user_id: "dev".into(),
                }],
                config.daily_quota,
            );
            (store, Some(key))
        } else {
            (Self::from_seeds(&config.api_keys, config.daily_quota), None)
        }
    }

    fn authorize_on_day(&self, api_key: &str, day: u64) -> Result<AuthorizedUser, AuthError> {
        let mut record = self
            .records
            .get_mut(&digest(api_key))
            .ok_or(AuthError::UnknownKey)?;

        if record.last_request_day != day {
            record.requests_today = 0;
            record.last_request_day = day;
        }
        if record.requests_today >= record.daily_quota {
            return Err(AuthError::QuotaExceeded);
        }
        record.requests_today += 1;

        Ok(AuthorizedUser {
            user_id: record.user_id.clone(),
            requests_today: record.requests_today,
            daily_quota: record.daily_quota,
        })
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn validate_headless_session(&self, client_id: &str, token: &str) -> bool {
        // Worlds authenticate with an API key as their connection token.
        !client_id.is_empty() && self.records.contains_key(&digest(token))
    }

    async fn authorize(&self, api_key: &str) -> Result<AuthorizedUser, AuthError> {
        self.authorize_on_day(api_key, current_day())
    }

    async fn reset_daily_counters(&self) -> Result<u64, AuthError> {
        let mut changed = 0u64;
        for mut record in self.records.iter_mut() {
            if record.requests_today != 0 {
                record.requests_today = 0;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

fn digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a random development API key (hex, 32 chars).
fn generate_api_key() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Axum middleware guarding the REST surface with the `x-api-key` header.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(api_key) = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "MissingApiKey",
            Some("send the x-api-key header"),
        );
    };

    match state.credentials.authorize(api_key).await {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(AuthError::UnknownKey) => {
            state.telemetry.warn("rejected unknown api key", json!({}));
            error_response(StatusCode::FORBIDDEN, "InvalidApiKey", None)
        }
        Err(AuthError::QuotaExceeded) => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "QuotaExceeded",
            Some("daily request quota reached, retry after the daily reset"),
        ),
        Err(AuthError::Backend(e)) => {
            state
                .telemetry
                .error("credential backend unavailable", json!({"error": e}));
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "AuthBackendUnavailable", None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(quota: u32) -> MemoryCredentialStore {
        MemoryCredentialStore::from_seeds(
            &[ApiKeySeed {
                key: "k1".into(),
                user_id: "alice".into(),
            }],
            quota,
        )
    }

    #[tokio::test]
    async fn headless_session_requires_known_key() {
        let store = store(10);
        assert!(store.validate_headless_session("W1", "k1").await);
        assert!(!store.validate_headless_session("W1", "nope").await);
        assert!(!store.validate_headless_session("", "k1").await);
    }

    #[tokio::test]
    async fn quota_enforced_within_a_day() {
        let store = store(2);
        let day = 19_000;

        assert_eq!(store.authorize_on_day("k1", day).unwrap().requests_today, 1);
        assert_eq!(store.authorize_on_day("k1", day).unwrap().requests_today, 2);
        assert_eq!(
            store.authorize_on_day("k1", day).unwrap_err(),
            AuthError::QuotaExceeded
        );

        // The next day rolls the window over.
        assert_eq!(
            store.authorize_on_day("k1", day + 1).unwrap().requests_today,
            1
        );
    }

    #[tokio::test]
    async fn unknown_key_rejected() {
        let store = store(10);
        assert_eq!(
            store.authorize("missing").await.unwrap_err(),
            AuthError::UnknownKey
        );
    }

    #[tokio::test]
    async fn bulk_reset_zeroes_counters() {
        let store = store(5);
        let day = 19_000;
        store.authorize_on_day("k1", day).unwrap();
        store.authorize_on_day("k1", day).unwrap();

        assert_eq!(store.reset_daily_counters().await.unwrap(), 1);
        assert_eq!(store.reset_daily_counters().await.unwrap(), 0);
        assert_eq!(store.authorize_on_day("k1", day).unwrap().requests_today, 1);
    }

    #[test]
    fn generated_dev_key_when_unseeded() {
        let config = ServerConfig::default();
        let (store, generated) = MemoryCredentialStore::from_config(&config);
        let key = generated.expect("a dev key should be generated");
        assert_eq!(key.len(), 32);
        assert!(store.records.contains_key(&digest(&key)));
    }
}
