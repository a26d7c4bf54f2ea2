//! Live server sessions and broadcast.
//!
//! Every accepted connection is registered here for its lifetime. Broadcast
//! either sends immediately or, when throttled, keeps only the most recent
//! payload until the next [`SessionRegistry::drain`].

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use wss_wire::{CloseCode, Frame};

use crate::error::SessionError;
use crate::transport::{ConnectionHandle, ConnectionId};

/// Identifies a registered session
pub type SessionId = ConnectionId;

/// Runs once when a session is unregistered
pub type CloseHook = Box<dyn FnOnce(SessionId) + Send + Sync>;

/// Who receives broadcasts and when
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastPolicy {
    /// Coalesce broadcasts and deliver on drain
    pub throttled: bool,
    /// Skip sessions that have not authenticated
    pub authenticated_only: bool,
}

impl Default for BroadcastPolicy {
    fn default() -> Self {
        Self {
            throttled: false,
            authenticated_only: true,
        }
    }
}

/// Result of one broadcast call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions the frame was queued to
    pub delivered: usize,
    /// Sessions whose send failed
    pub failed: Vec<SessionId>,
    /// Frame was stored for the next drain instead of sent
    pub deferred: bool,
}

struct SessionEntry {
    handle: ConnectionHandle,
    authenticated: bool,
    on_close: Option<CloseHook>,
}

/// Registered sessions of one server
pub struct SessionRegistry {
    policy: BroadcastPolicy,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    pending: Mutex<Option<Frame>>,
}

impl SessionRegistry {
    /// Empty registry
    pub fn new(policy: BroadcastPolicy) -> Self {
        Self {
            policy,
            sessions: RwLock::new(HashMap::new()),
            pending: Mutex::new(None),
        }
    }

    /// Broadcast policy in force
    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    /// Add a connection. Sessions start unauthenticated.
    pub async fn register(&self, handle: ConnectionHandle) -> SessionId {
        let id = handle.id();
        let entry = SessionEntry {
            handle,
            authenticated: false,
            on_close: None,
        };
        self.sessions.write().await.insert(id, entry);
        debug!("Registered session {}", id);
        id
    }

    /// Attach the hook run when `id` is unregistered. Returns `false` if the
    /// session is gone.
    pub async fn set_close_hook(&self, id: SessionId, hook: CloseHook) -> bool {
        match self.sessions.write().await.get_mut(&id) {
            Some(entry) => {
                entry.on_close = Some(hook);
                true
            }
            None => false,
        }
    }

    /// Remove a session, closing its connection if still open and running its
    /// close hook. Returns `false` if it was already removed.
    pub async fn unregister(&self, id: SessionId) -> bool {
        let entry = self.sessions.write().await.remove(&id);
        let Some(entry) = entry else {
            return false;
        };

        entry.handle.close(CloseCode::NORMAL);
        debug!("Unregistered session {}", id);
        if let Some(hook) = entry.on_close {
            hook(id);
        }
        true
    }

    /// Flag a session as authenticated. Never reverts.
    pub async fn mark_authenticated(&self, id: SessionId) -> bool {
        match self.sessions.write().await.get_mut(&id) {
            Some(entry) => {
                entry.authenticated = true;
                true
            }
            None => false,
        }
    }

    /// Whether `id` is registered and authenticated
    pub async fn is_authenticated(&self, id: SessionId) -> bool {
        self.sessions
            .read()
            .await
            .get(&id)
            .map_or(false, |entry| entry.authenticated)
    }

    /// Connection handle of a session
    pub async fn handle(&self, id: SessionId) -> Option<ConnectionHandle> {
        self.sessions.read().await.get(&id).map(|entry| entry.handle.clone())
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is registered
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Number of authenticated sessions
    pub async fn authenticated_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.authenticated)
            .count()
    }

    /// Send a frame to one session
    pub async fn send_to(&self, id: SessionId, frame: Frame) -> Result<(), SessionError> {
        let handle = self
            .handle(id)
            .await
            .ok_or(SessionError::UnknownSession(id.0))?;
        handle.send(frame)?;
        Ok(())
    }

    /// Send a frame to every eligible session, or store it for the next drain
    /// when throttled. A stored frame replaces any frame not yet drained.
    pub async fn broadcast(&self, frame: Frame) -> BroadcastReport {
        if self.policy.throttled {
            let replaced = self
                .pending
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .replace(frame)
                .is_some();
            if replaced {
                debug!("Throttled broadcast replaced an undelivered payload");
            }
            return BroadcastReport {
                deferred: true,
                ..BroadcastReport::default()
            };
        }
        self.deliver(frame).await
    }

    /// Deliver the stored throttled frame, if any
    pub async fn drain(&self) -> Option<BroadcastReport> {
        let frame = self.pending.lock().unwrap_or_else(|p| p.into_inner()).take()?;
        Some(self.deliver(frame).await)
    }

    /// Whether a throttled frame is waiting
    pub fn has_pending(&self) -> bool {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    async fn deliver(&self, frame: Frame) -> BroadcastReport {
        let sessions = self.sessions.read().await;
        let mut report = BroadcastReport::default();

        for (id, entry) in sessions.iter() {
            if self.policy.authenticated_only && !entry.authenticated {
                continue;
            }
            match entry.handle.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Broadcast to session {} failed: {}", id, e);
                    report.failed.push(*id);
                }
            }
        }

        debug!(
            "Broadcast {} bytes to {} sessions ({} failed)",
            frame.len(),
            report.delivered,
            report.failed.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, ConnectionEvent, MemoryNetwork};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn recv_text(conn: &mut Connection) -> String {
        match tokio::time::timeout(Duration::from_secs(5), conn.next_event()).await {
            Ok(ConnectionEvent::Message(Frame::Text(text))) => text,
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    /// Registers a server-side endpoint and returns the remote end
    async fn connect(registry: &SessionRegistry, authenticated: bool) -> (SessionId, Connection) {
        let (server_side, client_side) = MemoryNetwork::pair("server", "client");
        let id = registry.register(server_side.handle().clone()).await;
        if authenticated {
            assert!(registry.mark_authenticated(id).await);
        }
        (id, client_side)
    }

    #[tokio::test]
    async fn test_immediate_broadcast_reaches_authenticated_only() {
        let registry = SessionRegistry::new(BroadcastPolicy::default());
        let (_, mut trusted) = connect(&registry, true).await;
        let (untrusted_id, mut untrusted) = connect(&registry, false).await;

        for payload in ["a", "b", "c"] {
            let report = registry.broadcast(Frame::text(payload)).await;
            assert_eq!(report.delivered, 1);
            assert!(!report.deferred);
        }
        assert_eq!(recv_text(&mut trusted).await, "a");
        assert_eq!(recv_text(&mut trusted).await, "b");
        assert_eq!(recv_text(&mut trusted).await, "c");

        // Anything broadcast to the untrusted session would arrive before this.
        registry.send_to(untrusted_id, Frame::text("direct")).await.unwrap();
        assert_eq!(recv_text(&mut untrusted).await, "direct");
    }

    #[tokio::test]
    async fn test_throttled_broadcast_delivers_latest_on_drain() {
        let registry = SessionRegistry::new(BroadcastPolicy {
            throttled: true,
            authenticated_only: true,
        });
        let (id, mut trusted) = connect(&registry, true).await;

        for payload in ["a", "b", "c"] {
            assert!(registry.broadcast(Frame::text(payload)).await.deferred);
        }
        assert!(registry.has_pending());

        let report = registry.drain().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert!(registry.drain().await.is_none());

        registry.send_to(id, Frame::text("marker")).await.unwrap();
        assert_eq!(recv_text(&mut trusted).await, "c");
        assert_eq!(recv_text(&mut trusted).await, "marker");
    }

    #[tokio::test]
    async fn test_ungated_broadcast_includes_unauthenticated() {
        let registry = SessionRegistry::new(BroadcastPolicy {
            throttled: false,
            authenticated_only: false,
        });
        let (_, mut anyone) = connect(&registry, false).await;

        assert_eq!(registry.broadcast(Frame::text("hello")).await.delivered, 1);
        assert_eq!(recv_text(&mut anyone).await, "hello");
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_block_others() {
        let registry = SessionRegistry::new(BroadcastPolicy::default());
        let (dead_id, _dead) = connect(&registry, true).await;
        let (_, mut live) = connect(&registry, true).await;

        registry.handle(dead_id).await.unwrap().close(CloseCode::GOING_AWAY);

        let report = registry.broadcast(Frame::text("still here")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![dead_id]);
        assert_eq!(recv_text(&mut live).await, "still here");
    }

    #[tokio::test]
    async fn test_unregister_closes_and_runs_hook_once() {
        let registry = SessionRegistry::new(BroadcastPolicy::default());
        let (id, mut remote) = connect(&registry, true).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        assert!(
            registry
                .set_close_hook(
                    id,
                    Box::new(move |_: SessionId| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                )
                .await
        );

        assert!(registry.unregister(id).await);
        assert!(!registry.unregister(id).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty().await);
        assert!(!registry.is_authenticated(id).await);

        match remote.next_event().await {
            ConnectionEvent::Closed(info) => assert_eq!(info.code, Some(CloseCode::NORMAL)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bookkeeping() {
        let registry = SessionRegistry::new(BroadcastPolicy::default());
        assert!(registry.is_empty().await);

        let (a, _ra) = connect(&registry, false).await;
        let (_b, _rb) = connect(&registry, true).await;
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.authenticated_count().await, 1);
        assert!(!registry.is_authenticated(a).await);

        registry.unregister(a).await;
        assert!(!registry.mark_authenticated(a).await);
        assert!(matches!(
            registry.send_to(a, Frame::text("x")).await,
            Err(SessionError::UnknownSession(_))
        ));
    }
}
