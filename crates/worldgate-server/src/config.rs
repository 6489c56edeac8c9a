//! Server configuration: environment variables + CLI overrides.
//!
//! Every knob has an environment variable and a default; CLI arguments,
//! when present, take precedence over the environment.

use std::time::Duration;
use worldgate_core::{GateError, GateResult};

/// Default listen port.
const DEFAULT_PORT: u16 = 3010;
/// Default world inactivity threshold before eviction (ms).
const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 60_000;
/// Default protocol-ping cadence (ms).
const DEFAULT_PING_INTERVAL_MS: u64 = 20_000;
/// Default inactivity-sweep cadence (ms).
const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 15_000;
/// Default per-dispatch upstream timeout (ms).
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default per-key daily request quota.
const DEFAULT_DAILY_QUOTA: u32 = 1_000;

/// An API key seed from the environment: the raw key and the user it maps to.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeySeed {
    pub key: String,
    pub user_id: String,
}

/// Resolved broker configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the combined HTTP + WebSocket listener binds to.
    pub port: u16,
    /// How long a world may stay silent before the sweep evicts it.
    pub inactivity_timeout: Duration,
    /// Cadence of protocol-level pings to each world.
    pub ping_interval: Duration,
    /// Cadence of the inactivity sweep.
    pub cleanup_interval: Duration,
    /// How long a dispatch waits for the world's reply.
    pub request_timeout: Duration,
    /// Log filter (overridden by `RUST_LOG` when set).
    pub log_level: String,
    /// API keys seeded from the environment (`key:user` pairs).
    pub api_keys: Vec<ApiKeySeed>,
    /// Per-key daily request quota.
    pub daily_quota: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            inactivity_timeout: Duration::from_millis(DEFAULT_INACTIVITY_TIMEOUT_MS),
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            cleanup_interval: Duration::from_millis(DEFAULT_CLEANUP_INTERVAL_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            log_level: "info".to_string(),
            api_keys: Vec::new(),
            daily_quota: DEFAULT_DAILY_QUOTA,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment, then apply CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when an environment value is present but cannot be
    /// parsed; misconfiguration should fail startup, not fall back silently.
    pub fn load(cli_port: Option<u16>, cli_log_level: Option<&str>) -> GateResult<Self> {
        let port = match cli_port {
            Some(p) => p,
            None => env_parse("PORT", DEFAULT_PORT)?,
        };

        let log_level = cli_log_level
            .map(str::to_string)
            .or_else(|| std::env::var("LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            port,
            inactivity_timeout: Duration::from_millis(env_parse(
                "CLIENT_INACTIVITY_TIMEOUT_MS",
                DEFAULT_INACTIVITY_TIMEOUT_MS,
            )?),
            ping_interval: Duration::from_millis(env_parse(
                "WEBSOCKET_PING_INTERVAL_MS",
                DEFAULT_PING_INTERVAL_MS,
            )?),
            cleanup_interval: Duration::from_millis(env_parse(
                "CLIENT_CLEANUP_INTERVAL_MS",
                DEFAULT_CLEANUP_INTERVAL_MS,
            )?),
            request_timeout: Duration::from_millis(env_parse(
                "REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )?),
            log_level,
            api_keys: parse_api_keys(&std::env::var("API_KEYS").unwrap_or_default())?,
            daily_quota: env_parse("DAILY_REQUEST_QUOTA", DEFAULT_DAILY_QUOTA)?,
        })
    }
}

/// Parse an environment variable, falling back to `default` when unset.
fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> GateResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GateError::Config(format!("invalid value for {name}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

/// Parse the `API_KEYS` value: comma-separated `key:user` pairs.
fn parse_api_keys(raw: &str) -> GateResult<Vec<ApiKeySeed>> {
    let mut seeds = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, user_id) = entry
            .split_once(':')
            .ok_or_else(|| GateError::Config(format!("API_KEYS entry {entry:?} is not key:user")))?;
        if key.is_empty() || user_id.is_empty() {
            return Err(GateError::Config(format!(
                "API_KEYS entry {entry:?} has an empty key or user"
            )));
        }
        seeds.push(ApiKeySeed {
            key: key.to_string(),
            user_id: user_id.to_string(),
        });
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_timers() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3010);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(60));
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.cleanup_interval, Duration::from_secs(15));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn api_key_pairs_parse() {
        let seeds = parse_api_keys("abc:alice, def:bob ,").unwrap();
        assert_eq!(
            seeds,
            vec![
                ApiKeySeed {
                    key: "abc".into(),
                    user_id: "alice".into()
                },
                ApiKeySeed {
                    key: "def".into(),
                    user_id: "bob".into()
                },
            ]
        );
        assert!(parse_api_keys("").unwrap().is_empty());
        assert!(parse_api_keys("no-colon").is_err());
        assert!(parse_api_keys(":user").is_err());
    }
}
