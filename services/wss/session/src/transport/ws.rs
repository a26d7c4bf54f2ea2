//! WebSocket transport over TCP, built on tokio-tungstenite.
//!
//! `wss://` addresses need the `tls` feature; without it connecting to one
//! fails with [`TransportError::InvalidAddress`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::{Error as WsError, UrlError};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use wss_wire::{CloseCode, Frame};

use super::{CloseInfo, Connection, ConnectionEvent, ConnectionHandle, Listener, Outbound, Transport};
use crate::error::TransportError;

/// Outbound WebSocket connector
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    /// New connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, address: &str) -> Result<Connection, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(address)
            .await
            .map_err(|e| map_connect_error(address, e))?;
        debug!("WebSocket upgrade to {} answered with {}", address, response.status());
        Ok(spawn_driver(stream, address.to_string()))
    }
}

/// Inbound WebSocket acceptor on a TCP port.
///
/// TCP connections are accepted on a background task and each WebSocket
/// upgrade runs on its own task, so a peer that never completes the upgrade
/// holds up nobody else. [`Listener::accept`] yields upgraded connections in
/// the order their upgrades finish.
pub struct WsListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Connection>,
    acceptor: JoinHandle<()>,
}

impl WsListener {
    /// Bind to `addr`
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (incoming_tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        let acceptor = tokio::spawn(accept_loop(listener, incoming_tx));
        Ok(Self {
            local_addr,
            incoming,
            acceptor,
        })
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> Result<Connection, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::ListenerClosed)
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }
}

/// Upgraded connections waiting for [`Listener::accept`]
const ACCEPT_BACKLOG: usize = 64;

async fn accept_loop(listener: TcpListener, incoming: mpsc::Sender<Connection>) {
    loop {
        let (tcp, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept TCP connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if incoming.is_closed() {
            return;
        }

        let incoming = incoming.clone();
        tokio::spawn(async move {
            let stream = match tokio_tungstenite::accept_async(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("WebSocket handshake with {} failed: {}", remote, e);
                    return;
                }
            };
            if incoming.send(spawn_driver(stream, remote.to_string())).await.is_err() {
                debug!("Listener gone; dropping connection from {}", remote);
            }
        });
    }
}

fn map_connect_error(address: &str, error: WsError) -> TransportError {
    match error {
        WsError::Io(e) => TransportError::from_connect_io(address, e),
        WsError::Url(UrlError::TlsFeatureNotEnabled) => TransportError::InvalidAddress(format!(
            "{} (TLS support not compiled in)",
            address
        )),
        WsError::Url(e) => TransportError::InvalidAddress(format!("{}: {}", address, e)),
        other => TransportError::WebSocket(other.to_string()),
    }
}

/// Split a WebSocket stream into writer and reader tasks feeding a
/// [`Connection`]
fn spawn_driver<S>(stream: WebSocketStream<S>, peer: String) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(peer.clone(), outbound_tx);

    let writer_peer = peer.clone();
    tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            let message = match item {
                Outbound::Frame(Frame::Text(text)) => Message::Text(text),
                Outbound::Frame(Frame::Binary(data)) => Message::Binary(data.to_vec()),
                Outbound::Close(code) => {
                    let frame = CloseFrame {
                        code: WsCloseCode::from(code.0),
                        reason: Cow::Borrowed(""),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!("Close to {} not delivered: {}", writer_peer, e);
                    }
                    return;
                }
            };
            if let Err(e) = sink.send(message).await {
                warn!("Write to {} failed: {}", writer_peer, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        let info = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    let _ = events_tx.send(ConnectionEvent::Message(Frame::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = events_tx.send(ConnectionEvent::Message(Frame::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => {
                            CloseInfo::clean(CloseCode(u16::from(frame.code)), frame.reason.into_owned())
                        }
                        None => CloseInfo {
                            code: None,
                            reason: String::new(),
                            was_clean: true,
                        },
                    };
                }
                // Ping and pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) | None => {
                    break CloseInfo::abnormal("connection closed without close frame");
                }
                Some(Err(e)) => {
                    debug!("Read from {} failed: {}", peer, e);
                    break CloseInfo::abnormal(e.to_string());
                }
            }
        };
        let _ = events_tx.send(ConnectionEvent::Closed(info));
    });

    Connection::new(handle, events_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_websocket_round_trip_over_loopback() {
        let mut listener = WsListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let address = format!("ws://{}", listener.local_addr());

        let accept = tokio::spawn(async move { listener.accept().await });
        let mut client = WsTransport::new().connect(&address).await.unwrap();
        let mut server = accept.await.unwrap().unwrap();

        client.handle().send(Frame::text("ping")).unwrap();
        assert_eq!(server.next_event().await, ConnectionEvent::Message(Frame::text("ping")));

        server.handle().send(Frame::binary(vec![1u8, 2, 3])).unwrap();
        assert_eq!(
            client.next_event().await,
            ConnectionEvent::Message(Frame::binary(vec![1u8, 2, 3]))
        );

        server.handle().close(CloseCode::POLICY);
        match client.next_event().await {
            ConnectionEvent::Closed(info) => assert_eq!(info.code, Some(CloseCode::POLICY)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stalled_upgrade_does_not_block_other_clients() {
        let mut listener = WsListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let address = format!("ws://{}", listener.local_addr());

        // Opens TCP and never sends the upgrade request.
        let _stalled = tokio::net::TcpStream::connect(listener.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = tokio::time::timeout(TIMEOUT, WsTransport::new().connect(&address))
            .await
            .expect("second client was blocked by the stalled one")
            .unwrap();
        let mut server = tokio::time::timeout(TIMEOUT, listener.accept())
            .await
            .expect("upgraded connection never reached accept")
            .unwrap();

        server.handle().send(Frame::text("welcome")).unwrap();
        assert_eq!(client.next_event().await, ConnectionEvent::Message(Frame::text("welcome")));
    }

    #[tokio::test]
    async fn test_failed_upgrade_is_skipped() {
        use tokio::io::AsyncWriteExt;

        let mut listener = WsListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let address = format!("ws://{}", listener.local_addr());

        let mut garbage = tokio::net::TcpStream::connect(listener.local_addr()).await.unwrap();
        garbage.write_all(b"not an http request\r\n\r\n").await.unwrap();

        let _client = WsTransport::new().connect(&address).await.unwrap();
        let server = tokio::time::timeout(TIMEOUT, listener.accept()).await.unwrap().unwrap();
        assert!(!server.handle().is_closed());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_refused() {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let result = WsTransport::new().connect(&format!("ws://127.0.0.1:{}", port)).await;
        assert!(matches!(result, Err(TransportError::ConnectionRefused(_))));
    }

    #[test]
    fn test_url_errors_are_invalid_addresses() {
        let err = map_connect_error("wss://x", WsError::Url(UrlError::TlsFeatureNotEnabled));
        assert!(matches!(err, TransportError::InvalidAddress(_)));
        assert!(!err.is_connection_failure());
    }
}
