//! Tunnel sessions
//!
//! A session is one browser <-> display server tunnel. The browser side is
//! driven by the WebSocket handler; everything else talks to it through a
//! [`SessionHandle`], which only queues frames and close requests.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Frames queued towards one browser before the bridge waits
const OUTBOUND_QUEUE: usize = 64;

/// Opaque session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Admitted,
    Connected,
    Closed,
}

/// An admitted tunnel request
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub vm: String,
    pub port: u16,
    pub opened_at: DateTime<Utc>,
}

impl Session {
    pub fn new(vm: impl Into<String>, port: u16) -> Self {
        Self {
            id: SessionId::new(),
            vm: vm.into(),
            port,
            opened_at: Utc::now(),
        }
    }
}

/// Point-in-time view of a session, as served by the API
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    #[serde(flatten)]
    pub session: Session,
    pub phase: SessionPhase,
}

/// Something for the browser side to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Forward a binary frame
    Frame(Bytes),
    /// Close the WebSocket with the given status code
    Close(u16),
}

/// The browser side of a session is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGone;

/// Strong handle to a session's outbound queue, held by the transport
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    tx: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    /// Create a handle and the receiving end the transport drains
    pub fn channel(id: SessionId) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Weak reference for components that must not keep the session alive
    pub fn downgrade(&self) -> WeakSessionHandle {
        WeakSessionHandle {
            id: self.id,
            tx: self.tx.downgrade(),
        }
    }

    /// Ask the transport to close the session
    pub async fn close(&self, code: u16) {
        let _ = self.tx.send(SessionEvent::Close(code)).await;
    }
}

/// Weak reference to a session; every operation fails once the transport
/// dropped its [`SessionHandle`]
#[derive(Debug, Clone)]
pub struct WeakSessionHandle {
    id: SessionId,
    tx: mpsc::WeakSender<SessionEvent>,
}

impl WeakSessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Push a binary frame towards the browser
    pub async fn send_frame(&self, frame: Bytes) -> Result<(), SessionGone> {
        let tx = self.tx.upgrade().ok_or(SessionGone)?;
        tx.send(SessionEvent::Frame(frame))
            .await
            .map_err(|_| SessionGone)
    }

    /// Ask the transport to close the session
    pub async fn request_close(&self, code: u16) {
        if let Some(tx) = self.tx.upgrade() {
            let _ = tx.send(SessionEvent::Close(code)).await;
        }
    }
}
