//! Frames exchanged over a transport connection and WebSocket close codes.

use bytes::Bytes;
use std::fmt;

use crate::error::WireError;

/// A single discrete message on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame
    Text(String),
    /// Opaque binary frame
    Binary(Bytes),
}

impl Frame {
    /// Build a text frame
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }

    /// Build a binary frame
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Frame::Binary(data.into())
    }

    /// Build a frame from a raw payload and the transport's binary flag
    pub fn from_parts(payload: Bytes, is_binary: bool) -> Result<Self, WireError> {
        if is_binary {
            return Ok(Frame::Binary(payload));
        }
        String::from_utf8(payload.to_vec())
            .map(Frame::Text)
            .map_err(|_| WireError::Utf8)
    }

    /// Whether this is a binary frame
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }

    /// Text content, if this is a text frame
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text),
            Frame::Binary(_) => None,
        }
    }

    /// Raw payload bytes regardless of frame kind
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(data) => data,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload().len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// WebSocket close status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal closure
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// Endpoint is going away
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// Connection dropped without a close frame
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    /// Policy violation, used when authentication rejects a peer
    pub const POLICY: CloseCode = CloseCode(1008);
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        CloseCode(code)
    }
}
