//! Wire error types.

use thiserror::Error;

/// Wire errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Control message could not be decoded
    #[error("malformed control message: {0}")]
    MalformedControl(String),

    /// Control message could not be encoded
    #[error("control message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Text frame payload is not valid UTF-8
    #[error("text frame is not valid utf-8")]
    Utf8,
}
