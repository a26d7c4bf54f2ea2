//! In-process transport.
//!
//! Connections are pairs of channels pumped by small tasks, so closing one end
//! delivers a close event to both ends just like a WebSocket closing
//! handshake. Used by tests and by embedders that want sessions without
//! sockets.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::{CloseInfo, Connection, ConnectionEvent, ConnectionHandle, Listener, Outbound, Transport};
use crate::error::TransportError;

type Listeners = HashMap<String, mpsc::UnboundedSender<Connection>>;

/// Named in-process endpoints. Clones share the same address space; separate
/// `MemoryNetwork::new()` values do not.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<Listeners>>,
}

impl MemoryNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening on `address`
    pub fn listen(&self, address: &str) -> Result<MemoryListener, TransportError> {
        let mut listeners = self.lock();
        if let Some(existing) = listeners.get(address) {
            if !existing.is_closed() {
                return Err(TransportError::Io(std::io::Error::from(
                    std::io::ErrorKind::AddrInUse,
                )));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(address.to_string(), tx);
        debug!("Memory listener bound at {}", address);

        Ok(MemoryListener {
            address: address.to_string(),
            incoming: rx,
            network: self.clone(),
        })
    }

    /// Two connected endpoints, named after each other's peer. Must be called
    /// within a Tokio runtime.
    pub fn pair(a_name: &str, b_name: &str) -> (Connection, Connection) {
        let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
        let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
        let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
        let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(a_out_rx, a_events_tx.clone(), b_events_tx.clone()));
        tokio::spawn(pump(b_out_rx, b_events_tx, a_events_tx));

        (
            Connection::new(ConnectionHandle::new(b_name, a_out_tx), a_events_rx),
            Connection::new(ConnectionHandle::new(a_name, b_out_tx), b_events_rx),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn connect(&self, address: &str) -> Result<Connection, TransportError> {
        let listener = self
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused(address.to_string()))?;

        let (client, server) = Self::pair("memory-client", address);
        listener
            .send(server)
            .map_err(|_| TransportError::ConnectionRefused(address.to_string()))?;
        Ok(client)
    }
}

/// Accepting end of a [`MemoryNetwork`] address. Dropping it frees the address.
pub struct MemoryListener {
    address: String,
    incoming: mpsc::UnboundedReceiver<Connection>,
    network: MemoryNetwork,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::ListenerClosed)
    }

    fn local_addr(&self) -> String {
        self.address.clone()
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.incoming.close();
        let mut listeners = self.network.lock();
        if listeners.get(&self.address).map_or(false, |tx| tx.is_closed()) {
            listeners.remove(&self.address);
        }
    }
}

/// Forward one side's outbound queue into the other side's events
async fn pump(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    own_events: mpsc::UnboundedSender<ConnectionEvent>,
    peer_events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                // Peer has stopped reading; keep draining so close still works.
                let _ = peer_events.send(ConnectionEvent::Message(frame));
            }
            Outbound::Close(code) => {
                let info = CloseInfo::clean(code, "");
                let _ = peer_events.send(ConnectionEvent::Closed(info.clone()));
                let _ = own_events.send(ConnectionEvent::Closed(info));
                return;
            }
        }
    }

    // Every handle dropped without closing.
    let info = CloseInfo::abnormal("endpoint dropped");
    let _ = peer_events.send(ConnectionEvent::Closed(info.clone()));
    let _ = own_events.send(ConnectionEvent::Closed(info));
}

#[cfg(test)]
mod tests {
    use super::*;
    use wss_wire::{CloseCode, Frame};

    #[tokio::test]
    async fn test_pair_delivers_in_order_then_close_reaches_both_ends() {
        let (mut a, mut b) = MemoryNetwork::pair("a", "b");
        assert_eq!(a.handle().peer(), "b");

        a.handle().send(Frame::text("one")).unwrap();
        a.handle().send(Frame::binary(vec![2u8])).unwrap();
        a.handle().close(CloseCode::GOING_AWAY);

        assert_eq!(b.next_event().await, ConnectionEvent::Message(Frame::text("one")));
        assert_eq!(b.next_event().await, ConnectionEvent::Message(Frame::binary(vec![2u8])));
        assert_eq!(
            b.next_event().await,
            ConnectionEvent::Closed(CloseInfo::clean(CloseCode::GOING_AWAY, ""))
        );
        assert!(b.handle().is_closed());
        assert!(matches!(a.next_event().await, ConnectionEvent::Closed(_)));
    }

    #[tokio::test]
    async fn test_connect_without_listener_is_refused() {
        let network = MemoryNetwork::new();
        let result = network.connect("mem://nowhere").await;
        assert!(matches!(result, Err(TransportError::ConnectionRefused(addr)) if addr == "mem://nowhere"));
    }

    #[tokio::test]
    async fn test_listen_accept_and_release() {
        let network = MemoryNetwork::new();
        let mut listener = network.listen("mem://svc").unwrap();
        assert!(network.listen("mem://svc").is_err());

        let mut client = network.connect("mem://svc").await.unwrap();
        let server = listener.accept().await.unwrap();
        server.handle().send(Frame::text("hi")).unwrap();
        assert_eq!(client.next_event().await, ConnectionEvent::Message(Frame::text("hi")));

        drop(listener);
        assert!(matches!(
            network.connect("mem://svc").await,
            Err(TransportError::ConnectionRefused(_))
        ));
        assert!(network.listen("mem://svc").is_ok());
    }

    #[tokio::test]
    async fn test_networks_are_isolated() {
        let first = MemoryNetwork::new();
        let second = MemoryNetwork::new();
        let _listener = first.listen("mem://svc").unwrap();
        assert!(second.connect("mem://svc").await.is_err());
        assert!(first.clone().connect("mem://svc").await.is_ok());
    }
}
