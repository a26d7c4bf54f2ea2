//! Frames, close codes, and control messages for wss.
//!
//! This crate holds the small amount of wire-level vocabulary shared by the
//! authentication and session crates: the [`Frame`] type moved over a
//! connection, WebSocket [`CloseCode`]s, and the JSON [`ControlMessage`] used by
//! the authentication handshake.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod error;
pub mod frame;

// Re-export main types
pub use control::{classify_text, ControlMessage, AUTH_TYPE};
pub use error::WireError;
pub use frame::{CloseCode, Frame};
