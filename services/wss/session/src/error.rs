//! Session and transport error types.

use thiserror::Error;
use wss_auth::AuthError;
use wss_wire::WireError;

/// Errors raised while establishing or driving a connection
#[derive(Error, Debug)]
pub enum TransportError {
    /// Nothing is accepting connections at the address
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    /// Operating system level failure
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol or handshake failure
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Address could not be parsed or uses an unsupported scheme
    #[error("invalid address {0}")]
    InvalidAddress(String),

    /// Connection has been closed
    #[error("connection closed")]
    Closed,

    /// Listener will accept no further connections
    #[error("listener shut down")]
    ListenerClosed,
}

impl TransportError {
    /// Whether this is an ordinary failure to reach the peer (refused, reset,
    /// unreachable) rather than something unexpected
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, TransportError::ConnectionRefused(_) | TransportError::Io(_))
    }

    /// Classify an I/O error raised while connecting to `address`
    pub fn from_connect_io(address: &str, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::ConnectionRefused {
            TransportError::ConnectionRefused(address.to_string())
        } else {
            TransportError::Io(error)
        }
    }
}

/// Errors surfaced by the session layer
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Authentication failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Control message encoding failure
    #[error(transparent)]
    Wire(#[from] WireError),

    /// No live connection to send on
    #[error("not connected")]
    NotConnected,

    /// Session id is not registered
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// `run` was called on a session that is already running or finished
    #[error("session is already running")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_io_classification() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            TransportError::from_connect_io("ws://127.0.0.1:1", refused),
            TransportError::ConnectionRefused(addr) if addr == "ws://127.0.0.1:1"
        ));

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        let err = TransportError::from_connect_io("ws://127.0.0.1:1", reset);
        assert!(matches!(err, TransportError::Io(_)));
        assert!(err.is_connection_failure());

        assert!(!TransportError::WebSocket("bad upgrade".into()).is_connection_failure());
    }
}
