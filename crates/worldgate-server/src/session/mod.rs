//! World sessions: one live, authenticated WebSocket connection per world.

pub mod registry;

pub use registry::{Rejected, SessionInfo, SessionRegistry};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use worldgate_core::{Envelope, GateError, GateResult};

/// Close code for missing or invalid handshake credentials.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for internal broker errors.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Close code when a newer connection for the same world takes over.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code when the inactivity sweep evicts the session.
pub const CLOSE_IDLE: u16 = 4001;

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same `clientId` replaced this one.
    Superseded,
    /// No pong or inbound frame within the inactivity threshold.
    IdleTimeout,
    /// The underlying transport failed.
    TransportError,
    /// The world closed the connection.
    PeerClosed,
    /// Broker shutdown.
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the world, where one still can be.
    pub fn close_code(self) -> u16 {
        match self {
            CloseReason::Superseded => CLOSE_SUPERSEDED,
            CloseReason::IdleTimeout => CLOSE_IDLE,
            CloseReason::TransportError | CloseReason::PeerClosed => CLOSE_INTERNAL_ERROR,
            CloseReason::Shutdown => 1001,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Superseded => "superseded",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::TransportError => "transport error",
            CloseReason::PeerClosed => "peer closed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// A frame queued for the session's writer task.
///
/// The writer task owns the WebSocket sink; every outbound frame funnels
/// through this channel, which serializes writes without holding a lock
/// across the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
    Close { code: u16, reason: &'static str },
}

/// One live world connection.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    auth_token: String,
    conn_id: u64,
    connected_at: Instant,
    outbound: mpsc::Sender<OutboundFrame>,
    last_seen: Mutex<Instant>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        client_id: String,
        auth_token: String,
        conn_id: u64,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        let now = Instant::now();
        Self {
            client_id,
            auth_token,
            conn_id,
            connected_at: now,
            outbound,
            last_seen: Mutex::new(now),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The token the world authenticated with. Opaque to the broker.
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Process-unique connection id; distinguishes a superseded session
    /// from its successor under the same `clientId`.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token cancelled exactly once, when the session closes; the inbound
    /// pump selects on it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record inbound activity (any frame, including pong).
    pub fn touch(&self) {
        *self.last_seen.lock().expect("last_seen lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .expect("last_seen lock poisoned")
            .elapsed()
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue an envelope for the world.
    ///
    /// Fails with [`GateError::SessionClosed`] once the session is closed,
    /// or [`GateError::Transport`] when the writer task is gone, in which
    /// case the session is marked closed.
    pub async fn send(&self, envelope: &Envelope) -> GateResult<()> {
        if self.is_closed() {
            return Err(GateError::SessionClosed);
        }
        let text = envelope.to_text()?;
        self.outbound
            .send(OutboundFrame::Text(text))
            .await
            .map_err(|_| {
                self.closed.store(true, Ordering::Release);
                GateError::Transport("outbound channel closed".into())
            })
    }

    /// Queue a protocol-level ping.
    pub async fn send_ping(&self) -> GateResult<()> {
        if self.is_closed() {
            return Err(GateError::SessionClosed);
        }
        self.outbound.send(OutboundFrame::Ping).await.map_err(|_| {
            self.closed.store(true, Ordering::Release);
            GateError::Transport("outbound channel closed".into())
        })
    }

    /// Close the session. Idempotent; returns `true` only for the call
    /// that performed the close.
    ///
    /// Queues a best-effort close frame, then cancels the inbound pump.
    /// Deregistration and waiter failure are driven by the caller (the
    /// registry hands evicted sessions back for exactly that purpose).
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.outbound.try_send(OutboundFrame::Close {
            code: reason.close_code(),
            reason: reason.as_str(),
        });
        self.cancel.cancel();
        debug!(client_id = %self.client_id, conn_id = self.conn_id, reason = reason.as_str(), "session closed");
        true
    }
}
