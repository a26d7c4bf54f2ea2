//! Authenticated WebSocket sessions for wss.
//!
//! This crate provides the session layer on top of [`wss_wire`] frames and
//! [`wss_auth`] key agreement:
//!
//! - [`Server`]: accepts connections, runs the authentication handshake,
//!   dispatches payloads to single-slot handlers, and broadcasts (optionally
//!   throttled) to the authenticated sessions in its [`SessionRegistry`]
//! - [`ReconnectingSession`]: a client that keeps one connection alive,
//!   reconnecting with linear backoff
//! - [`transport`]: the connection abstraction with WebSocket and in-memory
//!   implementations
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wss_session::{ClientConfig, ReconnectingSession, Server, ServerConfig, WsListener, WsTransport};
//!
//! # async fn example() -> Result<(), wss_session::SessionError> {
//! let server = Arc::new(Server::new(ServerConfig::default(), None));
//! server.set_text_handler(|id, text| println!("{}: {}", id, text));
//! let listener = WsListener::bind("127.0.0.1:9000".parse().unwrap()).await?;
//! tokio::spawn(server.clone().serve(listener));
//!
//! let client = Arc::new(ReconnectingSession::new(
//!     ClientConfig::default(),
//!     Arc::new(WsTransport::new()),
//!     None,
//! ));
//! client.set_open_handler(|| println!("connected"));
//! client.run().await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod client;
pub mod error;
pub mod handlers;
pub mod handshake;
pub mod registry;
pub mod server;
pub mod transport;

// Re-export main types
pub use backoff::{Backoff, BackoffConfig};
pub use client::{ClientConfig, Phase, ReconnectingSession};
pub use error::{SessionError, TransportError};
pub use handshake::{AuthConfig, AuthContext, AuthState, Handshake, Step};
pub use registry::{BroadcastPolicy, BroadcastReport, SessionId, SessionRegistry};
pub use server::{Server, ServerConfig, DEFAULT_BROADCAST_INTERVAL};
pub use transport::{
    CloseInfo, Connection, ConnectionEvent, ConnectionHandle, ConnectionId, Listener, MemoryListener,
    MemoryNetwork, Transport, WsListener, WsTransport,
};
