//! Bridge manager
//!
//! Owns the session -> bridge table. Each entry is created when a tunnel is
//! established, consulted for every browser frame and removed when the
//! browser side goes away. Entries for different sessions live in different
//! `DashMap` shards, so sessions do not serialize on each other.

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, trace, warn};

use axum::extract::ws::close_code;

use crate::bridge::{Dialer, StreamBridge};
use crate::session::{
    Session, SessionHandle, SessionId, SessionPhase, SessionSnapshot, WeakSessionHandle,
};

/// How long shutdown waits for a browser queue to take the close event
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

struct Tunnel {
    session: Session,
    browser: WeakSessionHandle,
    bridge: Option<Arc<StreamBridge>>,
}

impl Tunnel {
    fn phase(&self) -> SessionPhase {
        match &self.bridge {
            None => SessionPhase::Admitted,
            Some(bridge) if bridge.is_live() => SessionPhase::Connected,
            Some(_) => SessionPhase::Closed,
        }
    }
}

/// Tracks every live tunnel
pub struct BridgeManager {
    display_host: String,
    dialer: Arc<dyn Dialer>,
    tunnels: DashMap<SessionId, Tunnel>,
}

impl BridgeManager {
    pub fn new(display_host: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            display_host: display_host.into(),
            dialer,
            tunnels: DashMap::new(),
        }
    }

    /// Dial the display server for a freshly upgraded session and start
    /// pumping. On dial failure the session is closed with a server error.
    ///
    /// `permit` is the session's worker slot; it is held by the inbound pump
    /// and released when the pump ends.
    pub async fn session_established(
        &self,
        session: Session,
        handle: &SessionHandle,
        permit: OwnedSemaphorePermit,
    ) -> bool {
        let id = session.id;
        let port = session.port;
        let vm = session.vm.clone();

        self.tunnels.insert(
            id,
            Tunnel {
                session,
                browser: handle.downgrade(),
                bridge: None,
            },
        );

        let bridge =
            match StreamBridge::open(self.dialer.as_ref(), &self.display_host, port, handle.downgrade())
                .await
            {
                Ok(bridge) => bridge,
                Err(e) => {
                    warn!("VNC connection for {} failed: {}", vm, e);
                    self.tunnels.remove(&id);
                    handle.close(close_code::ERROR).await;
                    return false;
                }
            };

        let replaced = self
            .tunnels
            .get_mut(&id)
            .map(|mut tunnel| tunnel.bridge.replace(bridge.clone()));
        match replaced {
            // Shut down while we were dialing
            None => {
                bridge.close().await;
                handle.close(close_code::AWAY).await;
                return false;
            }
            Some(Some(stale)) => stale.close().await,
            Some(None) => {}
        }

        info!(session = %id, vm = %vm, target = bridge.target(), "VNC tunnel connected");

        let pump = bridge.clone();
        tokio::spawn(async move {
            pump.pump_inbound().await;
            drop(permit);
        });

        true
    }

    /// Forward a browser frame to the session's display server
    pub async fn session_received_frame(&self, id: SessionId, frame: &[u8]) {
        // Clone out of the shard so the lock is not held across the write
        let bridge = self.tunnels.get(&id).and_then(|t| t.bridge.clone());

        match bridge {
            Some(bridge) if bridge.is_live() => bridge.send_outbound(frame).await,
            _ => trace!("Dropping {} bytes for closed session {}", frame.len(), id),
        }
    }

    /// Tear down the bridge of a session that ended on the browser side
    pub async fn session_closed(&self, id: SessionId) {
        let Some((_, tunnel)) = self.tunnels.remove(&id) else {
            return;
        };

        if let Some(bridge) = tunnel.bridge {
            bridge.close().await;
        }

        info!(session = %id, vm = %tunnel.session.vm, "VNC tunnel closed");
    }

    /// Number of tracked sessions
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Snapshot of all tracked sessions
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self
            .tunnels
            .iter()
            .map(|entry| SessionSnapshot {
                session: entry.session.clone(),
                phase: entry.phase(),
            })
            .collect();
        sessions.sort_by_key(|s| s.session.opened_at);
        sessions
    }

    /// Close every tunnel and tell each browser the server is going away.
    /// Used on shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self.tunnels.iter().map(|entry| *entry.key()).collect();
        debug!("Closing {} VNC tunnels", ids.len());

        let tunnels: Vec<Tunnel> = ids
            .iter()
            .filter_map(|id| self.tunnels.remove(id).map(|(_, tunnel)| tunnel))
            .collect();

        join_all(tunnels.into_iter().map(|tunnel| async move {
            if let Some(bridge) = &tunnel.bridge {
                bridge.close().await;
            }
            let notified = tokio::time::timeout(
                CLOSE_NOTIFY_TIMEOUT,
                tunnel.browser.request_close(close_code::AWAY),
            )
            .await;
            if notified.is_err() {
                warn!(session = %tunnel.session.id, "Browser queue full, close not delivered");
            }
            info!(session = %tunnel.session.id, vm = %tunnel.session.vm, "VNC tunnel closed");
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::FakeDialer;
    use crate::session::SessionEvent;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Semaphore;

    const WITHIN: Duration = Duration::from_secs(2);

    fn permit() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap()
    }

    #[tokio::test]
    async fn test_dial_failure_closes_session() {
        let dialer = FakeDialer::refusing();
        let manager = BridgeManager::new("127.0.0.1", dialer.clone());
        let session = Session::new("alpha", 5901);
        let (handle, mut events) = SessionHandle::channel(session.id);

        assert!(!manager.session_established(session, &handle, permit()).await);
        assert_eq!(events.recv().await, Some(SessionEvent::Close(close_code::ERROR)));
        assert!(manager.is_empty());
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_frames_reach_display_in_order() {
        let (dialer, mut peers) = FakeDialer::new();
        let manager = BridgeManager::new("127.0.0.1", dialer);
        let session = Session::new("alpha", 5901);
        let id = session.id;
        let (handle, _events) = SessionHandle::channel(id);

        assert!(manager.session_established(session, &handle, permit()).await);
        let (port, mut peer) = peers.recv().await.unwrap();
        assert_eq!(port, 5901);

        manager.session_received_frame(id, &[0x52, 0x46, 0x42, 0x20]).await;
        manager.session_received_frame(id, b"003.008\n").await;

        let mut received = [0u8; 12];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"RFB 003.008\n");

        let sessions = manager.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].phase, SessionPhase::Connected);
    }

    #[tokio::test]
    async fn test_session_close_releases_socket() {
        let (dialer, mut peers) = FakeDialer::new();
        let manager = BridgeManager::new("127.0.0.1", dialer);
        let session = Session::new("alpha", 5901);
        let id = session.id;
        let (handle, _events) = SessionHandle::channel(id);

        manager.session_established(session, &handle, permit()).await;
        let (_, mut peer) = peers.recv().await.unwrap();

        manager.session_closed(id).await;
        assert!(manager.is_empty());

        let mut buf = Vec::new();
        let n = tokio::time::timeout(WITHIN, peer.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // Late frames are dropped silently
        manager.session_received_frame(id, b"late").await;
        manager.session_closed(id).await;
    }

    #[tokio::test]
    async fn test_pump_releases_worker_slot() {
        let (dialer, mut peers) = FakeDialer::new();
        let manager = BridgeManager::new("127.0.0.1", dialer);
        let pool = Arc::new(Semaphore::new(1));
        let session = Session::new("alpha", 5901);
        let (handle, mut events) = SessionHandle::channel(session.id);

        let slot = pool.clone().try_acquire_owned().unwrap();
        manager.session_established(session, &handle, slot).await;
        assert_eq!(pool.available_permits(), 0);

        let (_, peer) = peers.recv().await.unwrap();
        drop(peer);

        let event = tokio::time::timeout(WITHIN, events.recv()).await.unwrap();
        assert_eq!(event, Some(SessionEvent::Close(close_code::NORMAL)));
        tokio::time::timeout(WITHIN, pool.acquire()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_all_notifies_browsers() {
        let (dialer, mut peers) = FakeDialer::new();
        let manager = BridgeManager::new("127.0.0.1", dialer);
        let session = Session::new("alpha", 5901);
        let (handle, mut events) = SessionHandle::channel(session.id);

        manager.session_established(session, &handle, permit()).await;
        let (_, mut peer) = peers.recv().await.unwrap();

        manager.close_all().await;
        assert!(manager.is_empty());

        let event = tokio::time::timeout(WITHIN, events.recv()).await.unwrap();
        assert_eq!(event, Some(SessionEvent::Close(close_code::AWAY)));

        let mut buf = Vec::new();
        let n = tokio::time::timeout(WITHIN, peer.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_pump_on_full_browser_queue() {
        let (dialer, mut peers) = FakeDialer::new();
        let manager = BridgeManager::new("127.0.0.1", dialer);
        let pool = Arc::new(Semaphore::new(1));
        let session = Session::new("alpha", 5901);
        let id = session.id;
        // Held but never drained
        let (handle, _events) = SessionHandle::channel(id);

        let slot = pool.clone().try_acquire_owned().unwrap();
        manager.session_established(session, &handle, slot).await;
        let (_, mut peer) = peers.recv().await.unwrap();

        // Far more chunks than the browser queue holds
        tokio::spawn(async move {
            let chunk = vec![0x42u8; 4096];
            for _ in 0..80 {
                if peer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.available_permits(), 0);

        manager.session_closed(id).await;
        tokio::time::timeout(WITHIN, pool.acquire())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let (dialer, mut peers) = FakeDialer::new();
        let manager = Arc::new(BridgeManager::new("127.0.0.1", dialer));

        let a = Session::new("alpha", 5901);
        let b = Session::new("gamma", 5902);
        let (a_id, b_id) = (a.id, b.id);
        let (a_handle, mut a_events) = SessionHandle::channel(a_id);
        let (b_handle, mut b_events) = SessionHandle::channel(b_id);

        manager.session_established(a, &a_handle, permit()).await;
        let (a_port, mut a_peer) = peers.recv().await.unwrap();
        manager.session_established(b, &b_handle, permit()).await;
        let (b_port, mut b_peer) = peers.recv().await.unwrap();
        assert_eq!((a_port, b_port), (5901, 5902));

        // A stalled display on session B must not hold up session A
        let big = vec![0xbbu8; 256 * 1024];
        let stalled = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.session_received_frame(b_id, &big).await;
            })
        };

        manager.session_received_frame(a_id, b"to-a").await;
        let mut got = [0u8; 4];
        tokio::time::timeout(WITHIN, a_peer.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"to-a");

        b_peer.write_all(b"from-b").await.unwrap();
        match tokio::time::timeout(WITHIN, b_events.recv()).await.unwrap() {
            Some(SessionEvent::Frame(bytes)) => assert_eq!(&bytes[..], b"from-b"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(a_events.try_recv().is_err());

        manager.close_all().await;
        tokio::time::timeout(WITHIN, stalled).await.unwrap().unwrap();
        assert!(manager.is_empty());
    }
}
