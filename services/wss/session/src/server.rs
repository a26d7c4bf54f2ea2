//! Session server: accepts connections, authenticates them, and dispatches
//! their payloads to the application.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wss_wire::{CloseCode, Frame};

use crate::error::{SessionError, TransportError};
use crate::handlers::ServerHandlers;
use crate::handshake::{AuthContext, Handshake, Step};
use crate::registry::{BroadcastPolicy, BroadcastReport, SessionId, SessionRegistry};
use crate::transport::{CloseInfo, Connection, ConnectionEvent, Listener};

/// Default interval between throttled broadcast deliveries
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

/// Server behaviour
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Coalesce broadcasts and deliver them every `broadcast_interval`
    pub broadcast_throttled: bool,
    /// Throttled delivery period
    pub broadcast_interval: Duration,
    /// With authentication on, broadcast only to authenticated sessions
    pub gate_broadcast: bool,
    /// With authentication on, withhold payloads from unauthenticated sessions
    pub gate_dispatch: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            broadcast_throttled: false,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            gate_broadcast: true,
            gate_dispatch: false,
        }
    }
}

/// Accepts and serves sessions. Authentication is on when an [`AuthContext`]
/// is supplied.
pub struct Server {
    config: ServerConfig,
    auth: Option<AuthContext>,
    registry: Arc<SessionRegistry>,
    handlers: Arc<ServerHandlers>,
}

impl Server {
    /// Create a server
    pub fn new(config: ServerConfig, auth: Option<AuthContext>) -> Self {
        let policy = BroadcastPolicy {
            throttled: config.broadcast_throttled,
            authenticated_only: auth.is_some() && config.gate_broadcast,
        };
        Self {
            config,
            auth,
            registry: Arc::new(SessionRegistry::new(policy)),
            handlers: Arc::new(ServerHandlers::default()),
        }
    }

    /// Configuration in force
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether connections must authenticate
    pub fn auth_enabled(&self) -> bool {
        self.auth.is_some()
    }

    /// Session registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handler for text payloads; replaces any previous one
    pub fn set_text_handler<F>(&self, handler: F)
    where
        F: Fn(SessionId, &str) + Send + Sync + 'static,
    {
        self.handlers.text.set(Arc::new(handler));
    }

    /// Handler for binary payloads; replaces any previous one
    pub fn set_binary_handler<F>(&self, handler: F)
    where
        F: Fn(SessionId, &[u8]) + Send + Sync + 'static,
    {
        self.handlers.binary.set(Arc::new(handler));
    }

    /// Handler run when a session is registered
    pub fn set_open_handler<F>(&self, handler: F)
    where
        F: Fn(SessionId) + Send + Sync + 'static,
    {
        self.handlers.open.set(Arc::new(handler));
    }

    /// Handler run when a session passes authentication
    pub fn set_authenticated_handler<F>(&self, handler: F)
    where
        F: Fn(SessionId) + Send + Sync + 'static,
    {
        self.handlers.authenticated.set(Arc::new(handler));
    }

    /// Handler run exactly once when a session is unregistered
    pub fn set_close_handler<F>(&self, handler: F)
    where
        F: Fn(SessionId) + Send + Sync + 'static,
    {
        self.handlers.close.set(Arc::new(handler));
    }

    /// Broadcast to eligible sessions (see [`SessionRegistry::broadcast`])
    pub async fn broadcast(&self, frame: Frame) -> BroadcastReport {
        self.registry.broadcast(frame).await
    }

    /// Send to one session
    pub async fn send_to(&self, id: SessionId, frame: Frame) -> Result<(), SessionError> {
        self.registry.send_to(id, frame).await
    }

    /// Close a session with `code` and unregister it
    pub async fn close_session(&self, id: SessionId, code: CloseCode) -> bool {
        if let Some(handle) = self.registry.handle(id).await {
            handle.close(code);
        }
        self.registry.unregister(id).await
    }

    /// Number of registered sessions
    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Whether any session is registered
    pub async fn has_clients(&self) -> bool {
        !self.registry.is_empty().await
    }

    /// Whether a session has authenticated
    pub async fn is_authenticated(&self, id: SessionId) -> bool {
        self.registry.is_authenticated(id).await
    }

    /// Accept connections until the listener shuts down. Each connection is
    /// served on its own task.
    pub async fn serve<L>(self: Arc<Self>, mut listener: L) -> Result<(), SessionError>
    where
        L: Listener + 'static,
    {
        info!(
            "Serving on {} (auth {}, throttled broadcast {})",
            listener.local_addr(),
            if self.auth_enabled() { "on" } else { "off" },
            self.config.broadcast_throttled
        );

        // Dropped with this future, so cancelling `serve` also stops draining.
        let _drain = self.config.broadcast_throttled.then(|| {
            let registry = self.registry.clone();
            let period = self.config.broadcast_interval;
            AbortOnDrop(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    registry.drain().await;
                }
            }))
        });

        let result = loop {
            match listener.accept().await {
                Ok(connection) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(connection).await });
                }
                Err(TransportError::ListenerClosed) => break Ok(()),
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        };

        info!("Listener {} closed", listener.local_addr());
        result
    }

    /// Serve one connection until it closes
    pub async fn handle_connection(self: Arc<Self>, mut connection: Connection) {
        let handle = connection.handle().clone();
        let id = self.registry.register(handle.clone()).await;
        info!("Session {} opened from {}", id, handle.peer());

        let handlers = self.handlers.clone();
        self.registry
            .set_close_hook(
                id,
                Box::new(move |id: SessionId| {
                    if let Some(on_close) = handlers.close.get() {
                        on_close(id);
                    }
                }),
            )
            .await;

        if let Some(on_open) = self.handlers.open.get() {
            on_open(id);
        }

        let mut handshake = self
            .auth
            .clone()
            .map(|context| Handshake::new(context, self.config.gate_dispatch));

        let ended = match handshake.as_mut().map(|h| h.start(&handle)) {
            Some(Err(e)) => {
                warn!("Could not start authentication with session {}: {}", id, e);
                CloseInfo::abnormal(e.to_string())
            }
            _ => self.read_loop(id, &mut connection, handshake.as_mut()).await,
        };

        info!("Session {} closed: {}", id, ended);
        self.registry.unregister(id).await;
    }

    async fn read_loop(
        &self,
        id: SessionId,
        connection: &mut Connection,
        mut handshake: Option<&mut Handshake>,
    ) -> CloseInfo {
        let handle = connection.handle().clone();
        loop {
            let frame = match connection.next_event().await {
                ConnectionEvent::Closed(info) => return info,
                ConnectionEvent::Message(frame) => frame,
            };
            if handle.is_closed() {
                return CloseInfo::clean(CloseCode::NORMAL, "closed locally");
            }

            let step = match handshake.as_deref_mut() {
                Some(handshake) => handshake.process(frame),
                None => Step::Deliver(frame),
            };

            match step {
                Step::Deliver(frame) => self.dispatch(id, frame),
                Step::Authenticated(peer) => {
                    self.registry.mark_authenticated(id).await;
                    info!("Session {} authenticated as {}", id, peer.fingerprint());
                    if let Some(on_auth) = self.handlers.authenticated.get() {
                        on_auth(id);
                    }
                }
                Step::Reject(e) => {
                    warn!("Authentication of session {} from {} failed: {}", id, handle.peer(), e);
                    handle.close(CloseCode::POLICY);
                    return CloseInfo::clean(CloseCode::POLICY, e.to_string());
                }
                Step::Withheld(frame) => {
                    debug!("Withheld {} byte payload from unauthenticated session {}", frame.len(), id);
                }
                Step::Ignored => {}
            }
        }
    }

    fn dispatch(&self, id: SessionId, frame: Frame) {
        match frame {
            Frame::Text(text) => match self.handlers.text.get() {
                Some(handler) => handler(id, &text),
                None => debug!("No text handler; dropped payload from session {}", id),
            },
            Frame::Binary(data) => match self.handlers.binary.get() {
                Some(handler) => handler(id, &data),
                None => debug!("No binary handler; dropped payload from session {}", id),
            },
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::tests::trusted_pair;
    use crate::transport::{MemoryNetwork, Transport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use wss_auth::{KeyAgreement, TrustRegistry, VerificationTag};
    use wss_wire::{classify_text, ControlMessage};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn announce(key: &KeyAgreement) -> Frame {
        ControlMessage::auth(key.public_value()).to_frame().unwrap()
    }

    async fn next(conn: &mut Connection) -> ConnectionEvent {
        tokio::time::timeout(TIMEOUT, conn.next_event())
            .await
            .expect("timed out waiting for event")
    }

    /// Spawn `server` on one end of a memory pair; returns the client end
    fn attach(server: &Arc<Server>) -> Connection {
        let (server_side, client_side) = MemoryNetwork::pair("server", "client");
        tokio::spawn(server.clone().handle_connection(server_side));
        client_side
    }

    fn collect_text(server: &Server) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        server.set_text_handler(move |_, text| {
            let _ = tx.send(text.to_string());
        });
        rx
    }

    #[tokio::test]
    async fn test_server_announces_then_authenticates_client() {
        let (server_ctx, client_ctx, _) = trusted_pair();
        let server_value = server_ctx.key().public_value().to_string();
        let server = Arc::new(Server::new(ServerConfig::default(), Some(server_ctx)));
        let mut texts = collect_text(&server);
        let (auth_tx, mut auth_rx) = mpsc::unbounded_channel();
        server.set_authenticated_handler(move |id| {
            let _ = auth_tx.send(id);
        });

        let mut client = attach(&server);
        match next(&mut client).await {
            ConnectionEvent::Message(Frame::Text(text)) => {
                assert_eq!(
                    classify_text(&text).unwrap().unwrap(),
                    ControlMessage::Auth { public_value: server_value }
                );
            }
            other => panic!("unexpected event {:?}", other),
        }

        client.handle().send(announce(client_ctx.key())).unwrap();
        client.handle().send(Frame::text("hello")).unwrap();

        let id = tokio::time::timeout(TIMEOUT, auth_rx.recv()).await.unwrap().unwrap();
        assert!(server.is_authenticated(id).await);
        assert_eq!(tokio::time::timeout(TIMEOUT, texts.recv()).await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_mismatched_tag_closes_before_later_payload() {
        let server_key = KeyAgreement::generate().unwrap();
        let client_key = KeyAgreement::generate().unwrap();
        let registry = TrustRegistry::from_entries([(
            client_key.public_value().clone(),
            VerificationTag::from_bytes([0u8; 32]),
        )]);
        let server = Arc::new(Server::new(
            ServerConfig::default(),
            Some(AuthContext::new(server_key, registry)),
        ));
        let mut texts = collect_text(&server);
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        server.set_close_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut client = attach(&server);
        assert!(matches!(next(&mut client).await, ConnectionEvent::Message(_)));
        client.handle().send(announce(&client_key)).unwrap();
        client.handle().send(Frame::text("must not arrive")).unwrap();

        match next(&mut client).await {
            ConnectionEvent::Closed(info) => assert_eq!(info.code, Some(CloseCode::POLICY)),
            other => panic!("unexpected event {:?}", other),
        }

        // The close hook runs after the registry entry is removed.
        tokio::time::timeout(TIMEOUT, async {
            while closes.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!server.has_clients().await);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(texts.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_peer_and_malformed_auth_are_rejected() {
        let (server_ctx, _, stranger) = trusted_pair();
        let server = Arc::new(Server::new(ServerConfig::default(), Some(server_ctx)));

        for offending in [announce(&stranger), Frame::text(r#"{"type":"auth","sharedSecret":5}"#)] {
            let mut client = attach(&server);
            assert!(matches!(next(&mut client).await, ConnectionEvent::Message(_)));
            client.handle().send(offending).unwrap();
            match next(&mut client).await {
                ConnectionEvent::Closed(info) => assert_eq!(info.code, Some(CloseCode::POLICY)),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_gate_withholds_until_authenticated() {
        let (server_ctx, client_ctx, _) = trusted_pair();
        let config = ServerConfig {
            gate_dispatch: true,
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(config, Some(server_ctx)));
        let mut texts = collect_text(&server);

        let mut client = attach(&server);
        assert!(matches!(next(&mut client).await, ConnectionEvent::Message(_)));
        client.handle().send(Frame::text("too early")).unwrap();
        client.handle().send(announce(client_ctx.key())).unwrap();
        client.handle().send(Frame::text("on time")).unwrap();

        assert_eq!(tokio::time::timeout(TIMEOUT, texts.recv()).await.unwrap().unwrap(), "on time");
    }

    #[tokio::test]
    async fn test_auth_disabled_passes_everything_through() {
        let server = Arc::new(Server::new(ServerConfig::default(), None));
        let mut texts = collect_text(&server);
        let (bin_tx, mut binaries) = mpsc::unbounded_channel();
        server.set_binary_handler(move |_, data| {
            let _ = bin_tx.send(data.to_vec());
        });

        let client = attach(&server);
        let lookalike = r#"{"type":"auth","sharedSecret":"123"}"#;
        client.handle().send(Frame::text(lookalike)).unwrap();
        client.handle().send(Frame::binary(vec![9u8, 8])).unwrap();

        assert_eq!(tokio::time::timeout(TIMEOUT, texts.recv()).await.unwrap().unwrap(), lookalike);
        assert_eq!(tokio::time::timeout(TIMEOUT, binaries.recv()).await.unwrap().unwrap(), vec![9u8, 8]);

        // Without authentication every session receives broadcasts.
        let report = server.broadcast(Frame::text("all")).await;
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_close_session_stops_dispatch() {
        let server = Arc::new(Server::new(ServerConfig::default(), None));
        let (open_tx, mut opened) = mpsc::unbounded_channel();
        server.set_open_handler(move |id| {
            let _ = open_tx.send(id);
        });

        let mut client = attach(&server);
        let id = tokio::time::timeout(TIMEOUT, opened.recv()).await.unwrap().unwrap();
        assert_eq!(server.session_count().await, 1);

        assert!(server.close_session(id, CloseCode::GOING_AWAY).await);
        assert!(!server.close_session(id, CloseCode::GOING_AWAY).await);
        match next(&mut client).await {
            ConnectionEvent::Closed(info) => assert_eq!(info.code, Some(CloseCode::GOING_AWAY)),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            server.send_to(id, Frame::text("gone")).await,
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_accepts_until_listener_closes() {
        let network = MemoryNetwork::new();
        let listener = network.listen("mem://serve").unwrap();
        let server = Arc::new(Server::new(ServerConfig::default(), None));
        let mut texts = collect_text(&server);
        let task = tokio::spawn(server.clone().serve(listener));

        let client = network.connect("mem://serve").await.unwrap();
        client.handle().send(Frame::text("via listener")).unwrap();
        assert_eq!(
            tokio::time::timeout(TIMEOUT, texts.recv()).await.unwrap().unwrap(),
            "via listener"
        );

        task.abort();
    }

    #[tokio::test]
    async fn test_cancelled_serve_stops_drain_ticker() {
        let network = MemoryNetwork::new();
        let listener = network.listen("mem://drain").unwrap();
        let config = ServerConfig {
            broadcast_throttled: true,
            broadcast_interval: Duration::from_millis(10),
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(config, None));

        let task = tokio::spawn(server.clone().serve(listener));
        tokio::time::timeout(TIMEOUT, async {
            while Arc::strong_count(server.registry()) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("drain ticker never started");

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tokio::time::timeout(TIMEOUT, async {
            while Arc::strong_count(server.registry()) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("drain ticker outlived serve");
    }
}
