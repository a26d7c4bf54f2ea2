//! Client session that keeps one connection to a server alive.
//!
//! [`ReconnectingSession::run`] is the control loop: connect, announce our
//! public value when authentication is on, dispatch payloads, and on close
//! either stop or reconnect. A close is followed by an immediate connect
//! attempt; the linear backoff only spaces out failed connect attempts. It is
//! not reset by a successful connection, only by [`ReconnectingSession::reconnect`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wss_wire::{CloseCode, Frame};

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::SessionError;
use crate::handlers::ClientHandlers;
use crate::handshake::{AuthContext, Handshake, Step};
use crate::transport::{CloseInfo, Connection, ConnectionEvent, ConnectionHandle, Transport};

/// Client behaviour
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. `ws://127.0.0.1:9000`
    pub address: String,
    /// Reconnect after failures and closes
    pub retry: bool,
    /// Reconnect delays
    pub backoff: BackoffConfig,
    /// With authentication on, withhold server payloads until the server has
    /// been verified
    pub gate_dispatch: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "ws://127.0.0.1:9000".to_string(),
            retry: true,
            backoff: BackoffConfig::default(),
            gate_dispatch: false,
        }
    }
}

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No connection and no attempt in flight
    Disconnected,
    /// Attempt in flight
    Connecting,
    /// Connection open
    Connected,
    /// Shut down; the control loop has ended
    Stopped,
}

#[derive(Debug)]
enum Control {
    Reconnect,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Closed,
    Reconnect,
    Shutdown,
}

/// Auto-reconnecting client session
pub struct ReconnectingSession {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    auth: Option<AuthContext>,
    handlers: ClientHandlers,
    phase: watch::Sender<Phase>,
    current: Mutex<Option<ConnectionHandle>>,
    authenticated: AtomicBool,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<Control>>>,
}

impl ReconnectingSession {
    /// Create a session. Authentication is on when an [`AuthContext`] is
    /// supplied. Nothing connects until [`run`](Self::run).
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, auth: Option<AuthContext>) -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            config,
            transport,
            auth,
            handlers: ClientHandlers::default(),
            phase,
            current: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            control_tx,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    /// Configuration in force
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Phase change notifications
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Whether a connection is open
    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    /// Whether the server on the current connection has been verified
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Handler run when a connection opens; replaces any previous one
    pub fn set_open_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers.open.set(Arc::new(handler));
    }

    /// Handler run when a connection ends
    pub fn set_close_handler<F>(&self, handler: F)
    where
        F: Fn(&CloseInfo) + Send + Sync + 'static,
    {
        self.handlers.close.set(Arc::new(handler));
    }

    /// Handler for text payloads
    pub fn set_text_handler<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.handlers.text.set(Arc::new(handler));
    }

    /// Handler for binary payloads
    pub fn set_binary_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.handlers.binary.set(Arc::new(handler));
    }

    /// Send a frame on the live connection
    pub fn send(&self, frame: Frame) -> Result<(), SessionError> {
        let handle = self.current_handle().ok_or(SessionError::NotConnected)?;
        handle.send(frame)?;
        Ok(())
    }

    /// Send a text frame
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(Frame::text(text))
    }

    /// Send a binary frame
    pub fn send_binary(&self, data: impl Into<bytes::Bytes>) -> Result<(), SessionError> {
        self.send(Frame::binary(data))
    }

    /// Close the live connection. With retry enabled the session reconnects
    /// afterwards, just as for a close initiated by the server.
    pub fn close(&self, code: CloseCode) -> Result<(), SessionError> {
        let handle = self.current_handle().ok_or(SessionError::NotConnected)?;
        handle.close(code);
        Ok(())
    }

    /// Reset the backoff and start a fresh connect cycle, closing the live
    /// connection if there is one
    pub fn reconnect(&self) {
        let _ = self.control_tx.send(Control::Reconnect);
    }

    /// Close the live connection and end the control loop
    pub fn shutdown(&self) {
        let _ = self.control_tx.send(Control::Shutdown);
    }

    /// Run the control loop on a new task
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<(), SessionError>> {
        let session = self.clone();
        tokio::spawn(async move { session.run().await })
    }

    /// Run the control loop until shutdown, or with retry disabled until the
    /// first connection ends. With retry disabled a failed connect is
    /// returned as an error. May only be called once.
    pub async fn run(&self) -> Result<(), SessionError> {
        let mut control = self
            .control_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or(SessionError::AlreadyRunning)?;
        let mut backoff = Backoff::new(self.config.backoff);

        loop {
            let connection = if self.config.retry {
                match self.connect_with_retry(&mut backoff, &mut control).await {
                    Some(connection) => connection,
                    None => break,
                }
            } else {
                self.connect_once().await?
            };

            match self.serve_connection(connection, &mut control).await {
                Ended::Shutdown => break,
                Ended::Reconnect => {
                    debug!("Manual reconnect to {}; backoff reset", self.config.address);
                    backoff.reset();
                }
                Ended::Closed if self.config.retry => {}
                Ended::Closed => return Ok(()),
            }
        }

        self.set_phase(Phase::Stopped);
        info!("Session to {} stopped", self.config.address);
        Ok(())
    }

    /// One attempt, no retry
    async fn connect_once(&self) -> Result<Connection, SessionError> {
        self.set_phase(Phase::Connecting);
        match self.transport.connect(&self.config.address).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                self.set_phase(Phase::Disconnected);
                if e.is_connection_failure() {
                    warn!("Connection to {} failed: {}", self.config.address, e);
                } else {
                    error!("Unexpected failure connecting to {}: {:?}", self.config.address, e);
                }
                Err(e.into())
            }
        }
    }

    /// Attempt until connected, sleeping the backoff delay after each
    /// failure. Returns `None` on shutdown.
    async fn connect_with_retry(
        &self,
        backoff: &mut Backoff,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Option<Connection> {
        loop {
            self.set_phase(Phase::Connecting);
            let attempt = tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(Control::Reconnect) => {
                        backoff.reset();
                        continue;
                    }
                    Some(Control::Shutdown) | None => return None,
                },
                attempt = self.transport.connect(&self.config.address) => attempt,
            };

            let failure = match attempt {
                Ok(connection) => return Some(connection),
                Err(e) => e,
            };

            self.set_phase(Phase::Disconnected);
            let delay = backoff.next_delay();
            if failure.is_connection_failure() {
                warn!(
                    "Connection to {} failed: {}; retrying in {}s",
                    self.config.address,
                    failure,
                    delay.as_secs()
                );
            } else {
                error!(
                    "Unexpected failure connecting to {}: {:?}; retrying in {}s",
                    self.config.address,
                    failure,
                    delay.as_secs()
                );
            }

            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(Control::Reconnect) => backoff.reset(),
                    Some(Control::Shutdown) | None => return None,
                },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn serve_connection(
        &self,
        mut connection: Connection,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> Ended {
        let handle = connection.handle().clone();
        self.authenticated.store(false, Ordering::SeqCst);
        *self.lock_current() = Some(handle.clone());
        self.set_phase(Phase::Connected);
        info!("Connected to {}", self.config.address);

        let mut handshake = self
            .auth
            .clone()
            .map(|context| Handshake::new(context, self.config.gate_dispatch));

        let (ended, info) = match handshake.as_mut().map(|h| h.start(&handle)) {
            Some(Err(e)) => {
                warn!("Could not announce public value to {}: {}", self.config.address, e);
                handle.close(CloseCode::NORMAL);
                (Ended::Closed, CloseInfo::abnormal(e.to_string()))
            }
            _ => {
                if let Some(on_open) = self.handlers.open.get() {
                    on_open();
                }
                self.read_loop(&mut connection, handshake.as_mut(), control).await
            }
        };

        *self.lock_current() = None;
        self.set_phase(Phase::Disconnected);
        info!("Disconnected from {}: {}", self.config.address, info);
        if let Some(on_close) = self.handlers.close.get() {
            on_close(&info);
        }
        ended
    }

    async fn read_loop(
        &self,
        connection: &mut Connection,
        mut handshake: Option<&mut Handshake>,
        control: &mut mpsc::UnboundedReceiver<Control>,
    ) -> (Ended, CloseInfo) {
        let handle = connection.handle().clone();
        loop {
            let event = tokio::select! {
                event = connection.next_event() => event,
                command = control.recv() => {
                    let ended = match command {
                        Some(Control::Reconnect) => Ended::Reconnect,
                        Some(Control::Shutdown) | None => Ended::Shutdown,
                    };
                    handle.close(CloseCode::NORMAL);
                    return (ended, CloseInfo::clean(CloseCode::NORMAL, "closed locally"));
                }
            };

            let frame = match event {
                ConnectionEvent::Closed(info) => return (Ended::Closed, info),
                ConnectionEvent::Message(frame) => frame,
            };
            if handle.is_closed() {
                return (Ended::Closed, CloseInfo::clean(CloseCode::NORMAL, "closed locally"));
            }

            let step = match handshake.as_deref_mut() {
                Some(handshake) => handshake.process(frame),
                None => Step::Deliver(frame),
            };

            match step {
                Step::Deliver(frame) => self.dispatch(frame),
                Step::Authenticated(peer) => {
                    self.authenticated.store(true, Ordering::SeqCst);
                    info!("Server {} authenticated as {}", self.config.address, peer.fingerprint());
                }
                Step::Reject(e) => {
                    warn!("Server {} failed authentication: {}", self.config.address, e);
                    handle.close(CloseCode::POLICY);
                    return (Ended::Closed, CloseInfo::clean(CloseCode::POLICY, e.to_string()));
                }
                Step::Withheld(frame) => {
                    debug!("Withheld {} byte payload from unverified server", frame.len());
                }
                Step::Ignored => {}
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Text(text) => {
                if let Some(handler) = self.handlers.text.get() {
                    handler(&text);
                }
            }
            Frame::Binary(data) => {
                if let Some(handler) = self.handlers.binary.get() {
                    handler(&data);
                }
            }
        }
    }

    fn set_phase(&self, phase: Phase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!("Session to {}: {:?} -> {:?}", self.config.address, previous, phase);
        }
    }

    fn current_handle(&self) -> Option<ConnectionHandle> {
        self.lock_current().clone()
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}
