//! Pending-request table: `requestId -> waiter` for in-flight dispatches.
//!
//! Every dispatch registers exactly one waiter; the waiter is resolved
//! exactly once by whichever of reply arrival, timeout, session loss, or
//! cancellation fires first. Registration and completion are O(1) and
//! never suspend.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;
use worldgate_core::Envelope;

/// Failure modes delivered into a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    SessionLost,
    Cancelled,
}

/// What a dispatch observes when its waiter resolves.
#[derive(Debug)]
pub enum WaitOutcome {
    Reply(Envelope),
    Timeout,
    SessionLost,
    Cancelled,
}

impl From<FailureKind> for WaitOutcome {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => WaitOutcome::Timeout,
            FailureKind::SessionLost => WaitOutcome::SessionLost,
            FailureKind::Cancelled => WaitOutcome::Cancelled,
        }
    }
}

enum Resolution {
    Reply(Envelope),
    Failed(FailureKind),
}

struct PendingEntry {
    tx: oneshot::Sender<Resolution>,
    /// Connection the request was routed to, so a session's close path can
    /// fail its waiters without a back-pointer from the session itself.
    conn_id: u64,
}

/// Concurrent table of in-flight request waiters.
pub struct PendingRequests {
    entries: Arc<DashMap<String, PendingEntry>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Mint a fresh, unguessable request id.
    pub fn new_request_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Insert a waiter for `request_id`, routed to `conn_id`.
    ///
    /// The returned [`Waiter`] removes its table entry on drop, so a
    /// caller that hangs up before the reply frees the slot immediately.
    pub fn register(&self, request_id: &str, conn_id: u64) -> Waiter {
        let (tx, rx) = oneshot::channel();
        self.entries
            .insert(request_id.to_string(), PendingEntry { tx, conn_id });
        Waiter {
            request_id: request_id.to_string(),
            rx,
            entries: self.entries.clone(),
        }
    }

    /// Deliver a world reply. Returns `false` when no waiter exists
    /// (late, duplicate, or unknown id); the caller logs and drops.
    pub fn complete(&self, request_id: &str, envelope: Envelope) -> bool {
        match self.entries.remove(request_id) {
            Some((_, entry)) => entry.tx.send(Resolution::Reply(envelope)).is_ok(),
            None => false,
        }
    }

    /// Fail a single waiter. Idempotent; a no-op once resolved.
    pub fn fail(&self, request_id: &str, kind: FailureKind) -> bool {
        match self.entries.remove(request_id) {
            Some((_, entry)) => entry.tx.send(Resolution::Failed(kind)).is_ok(),
            None => false,
        }
    }

    /// Fail every waiter routed to `conn_id`. Returns how many resolved.
    pub fn fail_for_session(&self, conn_id: u64, kind: FailureKind) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().conn_id == conn_id)
            .map(|entry| entry.key().clone())
            .collect();
        ids.iter().filter(|id| self.fail(id, kind)).count()
    }

    /// Fail every outstanding waiter (shutdown path).
    pub fn fail_all(&self, kind: FailureKind) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.fail(id, kind)).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One-shot completion slot for a single dispatch.
pub struct Waiter {
    request_id: String,
    rx: oneshot::Receiver<Resolution>,
    entries: Arc<DashMap<String, PendingEntry>>,
}

impl Waiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Block until exactly one outcome fires: the world's reply, the
    /// deadline, session loss, or cancellation.
    pub async fn await_reply(mut self, deadline: Duration) -> WaitOutcome {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(Resolution::Reply(envelope))) => WaitOutcome::Reply(envelope),
            Ok(Ok(Resolution::Failed(kind))) => kind.into(),
            // Sender dropped without resolving: the table entry was torn
            // down externally, treat as cancellation.
            Ok(Err(_)) => WaitOutcome::Cancelled,
            Err(_) => {
                self.entries.remove(&self.request_id);
                WaitOutcome::Timeout
            }
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.entries.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn reply(request_id: &str) -> Envelope {
        Envelope::reply("entity", request_id, Map::new())
    }

    #[tokio::test]
    async fn reply_resolves_waiter() {
        let pending = PendingRequests::new();
        let waiter = pending.register("r1", 1);
        assert_eq!(pending.len(), 1);

        assert!(pending.complete("r1", reply("r1")));
        match waiter.await_reply(Duration::from_secs(1)).await {
            WaitOutcome::Reply(env) => assert_eq!(env.request_id.as_deref(), Some("r1")),
            other => panic!("expected reply, got {other:?}"),
        }
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn unknown_request_id_is_a_noop() {
        let pending = PendingRequests::new();
        assert!(!pending.complete("nope", reply("nope")));
        assert!(!pending.fail("nope", FailureKind::Timeout));
    }

    #[tokio::test]
    async fn deadline_fires_timeout_and_frees_slot() {
        let pending = PendingRequests::new();
        let waiter = pending.register("r1", 1);

        let started = tokio::time::Instant::now();
        let outcome = waiter.await_reply(Duration::from_millis(30)).await;
        assert!(matches!(outcome, WaitOutcome::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn dropping_waiter_frees_slot() {
        let pending = PendingRequests::new();
        let waiter = pending.register("r1", 1);
        assert_eq!(pending.len(), 1);

        // The HTTP caller hung up before the reply arrived.
        drop(waiter);
        assert!(pending.is_empty());
        assert!(!pending.complete("r1", reply("r1")));
    }

    #[tokio::test]
    async fn session_loss_fails_only_that_sessions_waiters() {
        let pending = PendingRequests::new();
        let on_lost = pending.register("r1", 7);
        let on_other = pending.register("r2", 8);

        assert_eq!(pending.fail_for_session(7, FailureKind::SessionLost), 1);
        assert!(matches!(
            on_lost.await_reply(Duration::from_secs(1)).await,
            WaitOutcome::SessionLost
        ));

        assert!(pending.complete("r2", reply("r2")));
        assert!(matches!(
            on_other.await_reply(Duration::from_secs(1)).await,
            WaitOutcome::Reply(_)
        ));
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let pending = PendingRequests::new();
        let w1 = pending.register("r1", 1);
        let w2 = pending.register("r2", 2);

        assert_eq!(pending.fail_all(FailureKind::Cancelled), 2);
        assert!(pending.is_empty());
        assert!(matches!(
            w1.await_reply(Duration::from_secs(1)).await,
            WaitOutcome::Cancelled
        ));
        assert!(matches!(
            w2.await_reply(Duration::from_secs(1)).await,
            WaitOutcome::Cancelled
        ));
    }

    #[tokio::test]
    async fn out_of_order_replies_reach_their_own_waiters() {
        let pending = Arc::new(PendingRequests::new());
        let w1 = pending.register("r1", 1);
        let w2 = pending.register("r2", 1);

        // Replies arrive in reverse submission order.
        let mut env2 = reply("r2");
        env2.payload.insert("n".into(), serde_json::json!(2));
        let mut env1 = reply("r1");
        env1.payload.insert("n".into(), serde_json::json!(1));
        assert!(pending.complete("r2", env2));
        assert!(pending.complete("r1", env1));

        match w1.await_reply(Duration::from_secs(1)).await {
            WaitOutcome::Reply(env) => assert_eq!(env.payload["n"], serde_json::json!(1)),
            other => panic!("expected reply, got {other:?}"),
        }
        match w2.await_reply(Duration::from_secs(1)).await {
            WaitOutcome::Reply(env) => assert_eq!(env.payload["n"], serde_json::json!(2)),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_registration_resolves_exactly_once() {
        let pending = Arc::new(PendingRequests::new());
        let mut tasks = Vec::new();

        for i in 0..64 {
            let pending = pending.clone();
            tasks.push(tokio::spawn(async move {
                let rid = PendingRequests::new_request_id();
                let waiter = pending.register(&rid, i);
                let resolver = pending.clone();
                let resolver_id = rid.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        resolver.complete(&resolver_id, reply(&resolver_id));
                    } else {
                        resolver.fail(&resolver_id, FailureKind::SessionLost);
                    }
                });
                waiter.await_reply(Duration::from_secs(5)).await
            }));
        }

        for (i, task) in tasks.into_iter().enumerate() {
            let outcome = task.await.unwrap();
            if i % 2 == 0 {
                assert!(matches!(outcome, WaitOutcome::Reply(_)));
            } else {
                assert!(matches!(outcome, WaitOutcome::SessionLost));
            }
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn request_ids_are_unique() {
        let a = PendingRequests::new_request_id();
        let b = PendingRequests::new_request_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
