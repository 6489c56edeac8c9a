//! Registry of live world sessions, indexed by `clientId`.
//!
//! The broker's single source of truth for routing: at most one live
//! session per world at any instant. A new connection for an id that
//! already has one atomically supersedes the old session.

use super::{CloseReason, OutboundFrame, Session};
use crate::auth::CredentialStore;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Why a handshake was refused. Both map to close code 1008.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    MissingCredentials,
    InvalidCredentials,
}

impl Rejected {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejected::MissingCredentials => "missing id or token",
            Rejected::InvalidCredentials => "invalid credentials",
        }
    }
}

/// Snapshot of one registered world, for the introspection surface.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub client_id: String,
    pub idle_secs: u64,
    pub connected_secs: u64,
}

/// Concurrent map `clientId -> Session` with validated insertion and an
/// inactivity sweep.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    credentials: Arc<dyn CredentialStore>,
    next_conn_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            credentials,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Validate a world handshake and register its session.
    ///
    /// On success returns the new session plus the superseded one, if a
    /// connection for the same `clientId` already existed; the superseded
    /// session has been closed and the caller is expected to fail its
    /// in-flight waiters.
    pub async fn add(
        &self,
        client_id: &str,
        auth_token: &str,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Result<(Arc<Session>, Option<Arc<Session>>), Rejected> {
        if client_id.is_empty() || auth_token.is_empty() {
            return Err(Rejected::MissingCredentials);
        }
        if !self
            .credentials
            .validate_headless_session(client_id, auth_token)
            .await
        {
            warn!(client_id, "world handshake rejected");
            return Err(Rejected::InvalidCredentials);
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            client_id.to_string(),
            auth_token.to_string(),
            conn_id,
            outbound,
        ));

        let superseded = self.sessions.insert(client_id.to_string(), session.clone());
        if let Some(old) = &superseded {
            old.close(CloseReason::Superseded);
            info!(client_id, old_conn_id = old.conn_id(), conn_id, "world superseded");
        } else {
            info!(client_id, conn_id, "world registered");
        }

        Ok((session, superseded))
    }

    /// Remove `session` from the registry, but only while it is still the
    /// registered instance for its id. Idempotent; a superseded session's
    /// delayed close never removes its successor.
    pub fn remove(&self, client_id: &str, session: &Session) {
        let removed = self
            .sessions
            .remove_if(client_id, |_, stored| stored.conn_id() == session.conn_id());
        if removed.is_some() {
            debug!(client_id, conn_id = session.conn_id(), "world deregistered");
        }
    }

    /// Look up the live session for a world. Never returns a closed session.
    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(client_id)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.is_closed())
    }

    /// Close and remove every session idle for longer than `threshold`.
    /// Returns the evicted sessions so the caller can fail their waiters.
    pub fn sweep_inactive(&self, threshold: Duration) -> Vec<Arc<Session>> {
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > threshold)
            .map(|entry| entry.value().clone())
            .collect();

        let mut evicted = Vec::new();
        for session in stale {
            session.close(CloseReason::IdleTimeout);
            let removed = self
                .sessions
                .remove_if(session.client_id(), |_, stored| {
                    stored.conn_id() == session.conn_id()
                })
                .is_some();
            if removed {
                warn!(
                    client_id = %session.client_id(),
                    idle_secs = session.idle_for().as_secs(),
                    "world evicted for inactivity"
                );
                evicted.push(session);
            }
        }
        evicted
    }

    /// Close and drain every session (shutdown path).
    pub fn close_all(&self, reason: CloseReason) -> Vec<Arc<Session>> {
        let all: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in &all {
            session.close(reason);
        }
        self.sessions.clear();
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of all registered worlds.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionInfo {
                    client_id: session.client_id().to_string(),
                    idle_secs: session.idle_for().as_secs(),
                    connected_secs: session.connected_for().as_secs(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::config::ApiKeySeed;

    fn registry() -> SessionRegistry {
        let store = MemoryCredentialStore::from_seeds(
            &[ApiKeySeed {
                key: "k1".into(),
                user_id: "alice".into(),
            }],
            1000,
        );
        SessionRegistry::new(Arc::new(store))
    }

    fn channel() -> mpsc::Sender<OutboundFrame> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn add_get_remove() {
        let registry = registry();
        let (session, superseded) = registry.add("W1", "k1", channel()).await.unwrap();
        assert!(superseded.is_none());
        assert_eq!(registry.get("W1").unwrap().conn_id(), session.conn_id());
        assert!(registry.get("W2").is_none());

        registry.remove("W1", &session);
        assert!(registry.get("W1").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn invalid_credentials_rejected() {
        let registry = registry();
        assert_eq!(
            registry.add("W1", "wrong", channel()).await.unwrap_err(),
            Rejected::InvalidCredentials
        );
        assert_eq!(
            registry.add("", "k1", channel()).await.unwrap_err(),
            Rejected::MissingCredentials
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn supersession_closes_old_and_keeps_new() {
        let registry = registry();
        let (first, _) = registry.add("W1", "k1", channel()).await.unwrap();
        let (second, superseded) = registry.add("W1", "k1", channel()).await.unwrap();

        let old = superseded.unwrap();
        assert_eq!(old.conn_id(), first.conn_id());
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("W1").unwrap().conn_id(), second.conn_id());
    }

    #[tokio::test]
    async fn superseded_delayed_close_never_removes_successor() {
        let registry = registry();
        let (first, _) = registry.add("W1", "k1", channel()).await.unwrap();
        let (second, _) = registry.add("W1", "k1", channel()).await.unwrap();

        // The old connection's close path races in after supersession.
        registry.remove("W1", &first);
        registry.remove("W1", &first);
        assert_eq!(registry.get("W1").unwrap().conn_id(), second.conn_id());

        // Removing the successor itself still works, idempotently.
        registry.remove("W1", &second);
        registry.remove("W1", &second);
        assert!(registry.get("W1").is_none());
    }

    #[tokio::test]
    async fn get_never_returns_closed_session() {
        let registry = registry();
        let (session, _) = registry.add("W1", "k1", channel()).await.unwrap();
        session.close(CloseReason::TransportError);
        assert!(registry.get("W1").is_none());
    }

    #[tokio::test]
    async fn sweep_evicts_only_stale_sessions() {
        let registry = registry();
        let (stale, _) = registry.add("W1", "k1", channel()).await.unwrap();
        let (fresh, _) = registry.add("W2", "k1", channel()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        fresh.touch();

        let evicted = registry.sweep_inactive(Duration::from_millis(15));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].conn_id(), stale.conn_id());
        assert!(stale.is_closed());
        assert!(registry.get("W1").is_none());
        assert!(registry.get("W2").is_some());
    }

    #[tokio::test]
    async fn close_all_drains_registry() {
        let registry = registry();
        registry.add("W1", "k1", channel()).await.unwrap();
        registry.add("W2", "k1", channel()).await.unwrap();

        let closed = registry.close_all(CloseReason::Shutdown);
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|s| s.is_closed()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn concurrent_adds_leave_single_live_session() {
        let registry = Arc::new(registry());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.add("W1", "k1", channel()).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.len(), 1);
        let survivor = registry.get("W1").unwrap();
        assert!(!survivor.is_closed());
    }
}
