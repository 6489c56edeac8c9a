//! Broker assembly: shared state, background tasks, and the run loop.
//!
//! Owns the session registry, pending-request table, credential store,
//! and telemetry. Coordinates the inactivity sweep, the daily quota
//! reset, and graceful shutdown (close every session, cancel every
//! waiter).

use crate::auth::{reset, CredentialStore, MemoryCredentialStore, MemoryResetLock};
use crate::config::ServerConfig;
use crate::relay::{FailureKind, LoggingPushSink, PendingRequests, PushSink};
use crate::rest;
use crate::session::{CloseReason, SessionRegistry};
use crate::telemetry::{Metrics, PrometheusSink, TelemetrySink};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worldgate_core::GateResult;

/// Shared handles threaded through every handler and task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub pending: Arc<PendingRequests>,
    pub credentials: Arc<dyn CredentialStore>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub metrics: Arc<Metrics>,
    pub push_sink: Arc<dyn PushSink>,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig) -> GateResult<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let telemetry: Arc<dyn TelemetrySink> = PrometheusSink::new(&metrics);

        let (store, generated_key) = MemoryCredentialStore::from_config(&config);
        if let Some(key) = generated_key {
            warn!(api_key = %key, "no API_KEYS configured, generated an ephemeral development key");
        }
        let credentials: Arc<dyn CredentialStore> = Arc::new(store);

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new(credentials.clone())),
            pending: Arc::new(PendingRequests::new()),
            credentials,
            telemetry,
            metrics,
            push_sink: Arc::new(LoggingPushSink),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Drain all broker state: stop background tasks, close every
    /// session, and cancel every outstanding waiter.
    pub fn drain(&self) {
        self.shutdown.cancel();
        let closed = self.registry.close_all(CloseReason::Shutdown);
        let cancelled = self.pending.fail_all(FailureKind::Cancelled);
        self.metrics.connected_worlds.set(0);
        info!(
            sessions = closed.len(),
            waiters = cancelled,
            "broker state drained"
        );
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let mut config = ServerConfig::default();
        config.api_keys = vec![crate::config::ApiKeySeed {
            key: "test-key".into(),
            user_id: "tester".into(),
        }];
        Self::for_tests_with_config(config)
    }

    #[cfg(test)]
    pub(crate) fn for_tests_with_config(mut config: ServerConfig) -> Self {
        if config.api_keys.is_empty() {
            config.api_keys = vec![crate::config::ApiKeySeed {
                key: "test-key".into(),
                user_id: "tester".into(),
            }];
        }
        Self::new(config).expect("test state")
    }
}

/// Run the broker until `shutdown_signal` resolves.
pub async fn run(
    config: ServerConfig,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> GateResult<()> {
    let state = AppState::new(config)?;

    tokio::spawn(sweep_loop(state.clone()));
    tokio::spawn(reset::run_daily_reset(
        state.credentials.clone(),
        Arc::new(MemoryResetLock::new()),
        state.shutdown.clone(),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "worldgate listening");

    let app = rest::router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    state.drain();
    Ok(())
}

/// Periodic inactivity sweep: evict silent worlds and fail their
/// in-flight requests.
async fn sweep_loop(state: AppState) {
    let mut interval = tokio::time::interval(state.config.cleanup_interval);
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = interval.tick() => {
                let evicted = state.registry.sweep_inactive(state.config.inactivity_timeout);
                if evicted.is_empty() {
                    continue;
                }
                for session in &evicted {
                    state
                        .pending
                        .fail_for_session(session.conn_id(), FailureKind::SessionLost);
                }
                state
                    .metrics
                    .connected_worlds
                    .set(state.registry.len() as i64);
            }
        }
    }
}
