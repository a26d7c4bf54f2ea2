//! Connection abstraction shared by the server and client session loops.
//!
//! A [`Connection`] is split into a cloneable [`ConnectionHandle`] used to send
//! frames and close, and a stream of [`ConnectionEvent`]s consumed by exactly
//! one session task. Two implementations are provided: WebSocket over TCP
//! ([`ws`]) and an in-process network ([`memory`]).

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use wss_wire::{CloseCode, Frame};

use crate::error::TransportError;

pub mod memory;
pub mod ws;

pub use memory::{MemoryListener, MemoryNetwork};
pub use ws::{WsListener, WsTransport};

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Instruction for a connection's writer
#[derive(Debug)]
pub enum Outbound {
    /// Send a data frame
    Frame(Frame),
    /// Send a close frame and stop writing
    Close(CloseCode),
}

/// How a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code, if a close frame was exchanged
    pub code: Option<CloseCode>,
    /// Close reason or failure description
    pub reason: String,
    /// Whether the closing handshake completed
    pub was_clean: bool,
}

impl CloseInfo {
    /// Clean close with `code`
    pub fn clean(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
            was_clean: true,
        }
    }

    /// Connection dropped without a closing handshake
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: Some(CloseCode::ABNORMAL),
            reason: reason.into(),
            was_clean: false,
        }
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) if self.reason.is_empty() => write!(f, "code {}", code),
            Some(code) => write!(f, "code {} ({})", code, self.reason),
            None => write!(f, "no close code ({})", self.reason),
        }
    }
}

/// Something that happened on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A data frame arrived
    Message(Frame),
    /// The connection ended; no further events follow
    Closed(CloseInfo),
}

/// Sending half of a connection. Cheap to clone; all clones share close state.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Arc<str>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Handle writing into `outbound`, with a fresh id
    pub fn new(peer: impl Into<String>, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id: ConnectionId::next(),
            peer: Arc::from(peer.into()),
            outbound,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address as reported by the transport
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a frame. Fails once the connection is closed.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a raw payload as a text or binary frame
    pub fn send_message(&self, payload: impl Into<Bytes>, is_binary: bool) -> Result<(), TransportError> {
        let frame = Frame::from_parts(payload.into(), is_binary)
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        self.send(frame)
    }

    /// Close the connection with `code`. Returns `true` only for the call that
    /// actually closed it; later calls are no-ops.
    pub fn close(&self, code: CloseCode) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // The writer may already be gone if the peer hung up first.
        let _ = self.outbound.send(Outbound::Close(code));
        true
    }

    /// Whether `close` has been called or the connection otherwise ended
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record that the connection ended from the remote side
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A live connection: its handle plus the event stream
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Connection {
    /// Assemble a connection from its parts
    pub fn new(handle: ConnectionHandle, events: mpsc::UnboundedReceiver<ConnectionEvent>) -> Self {
        Self { handle, events }
    }

    /// Sending half
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Next event. A vanished driver is reported as an abnormal close.
    pub async fn next_event(&mut self) -> ConnectionEvent {
        match self.events.recv().await {
            Some(ConnectionEvent::Closed(info)) => {
                self.handle.mark_closed();
                ConnectionEvent::Closed(info)
            }
            Some(event) => event,
            None => {
                self.handle.mark_closed();
                ConnectionEvent::Closed(CloseInfo::abnormal("connection driver stopped"))
            }
        }
    }
}

/// Opens outbound connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `address`
    async fn connect(&self, address: &str) -> Result<Connection, TransportError>;
}

/// Accepts inbound connections
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next inbound connection. [`TransportError::ListenerClosed`]
    /// means no more will arrive; any other error concerns one attempt only.
    async fn accept(&mut self) -> Result<Connection, TransportError>;

    /// Address being listened on
    fn local_addr(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_idempotent_and_blocks_sends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new("peer", tx);
        let clone = handle.clone();

        handle.send(Frame::text("before")).unwrap();
        assert!(clone.close(CloseCode::POLICY));
        assert!(!handle.close(CloseCode::NORMAL));
        assert!(handle.is_closed());
        assert!(matches!(handle.send(Frame::text("after")), Err(TransportError::Closed)));

        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(Frame::Text(t))) if t == "before"));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close(CloseCode::POLICY))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ids_are_unique() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = ConnectionHandle::new("a", tx.clone());
        let b = ConnectionHandle::new("b", tx);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_send_message_checks_text_encoding() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new("peer", tx);

        handle.send_message(Bytes::from_static(&[0xff, 0x00]), true).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(Frame::Binary(_)))));
        assert!(handle.send_message(Bytes::from_static(&[0xff]), false).is_err());
    }

    #[tokio::test]
    async fn test_dropped_driver_reads_as_abnormal_close() {
        let (tx, _out) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(ConnectionHandle::new("peer", tx), events_rx);
        drop(events_tx);

        match conn.next_event().await {
            ConnectionEvent::Closed(info) => {
                assert_eq!(info.code, Some(CloseCode::ABNORMAL));
                assert!(!info.was_clean);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(conn.handle().is_closed());
    }
}
