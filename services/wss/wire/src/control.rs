//! JSON control messages carried on the text channel.
//!
//! The only control message is the authentication announcement:
//!
//! ```text
//! {"type": "auth", "sharedSecret": "<decimal public value>"}
//! ```
//!
//! The `sharedSecret` field carries the sender's *public* value. The name is
//! kept for compatibility with existing peers and does not appear outside this
//! module.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::trace;

use crate::error::WireError;
use crate::frame::Frame;

/// Value of the `type` field that marks an authentication message
pub const AUTH_TYPE: &str = "auth";

/// Structured control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Announces the sender's public value
    Auth {
        /// Decimal string of the sender's public value
        #[serde(rename = "sharedSecret")]
        public_value: String,
    },
}

impl ControlMessage {
    /// Build an auth message announcing `public_value`
    pub fn auth(public_value: impl Display) -> Self {
        ControlMessage::Auth {
            public_value: public_value.to_string(),
        }
    }

    /// Encode as JSON text
    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encode as a text frame
    pub fn to_frame(&self) -> Result<Frame, WireError> {
        self.encode().map(Frame::Text)
    }
}

/// Classify an inbound text payload.
///
/// Returns `None` for ordinary payloads (anything that is not a JSON object
/// whose `type` is `"auth"`), which must be passed through untouched. Returns
/// `Some(Err(..))` when the payload claims to be an auth message but does not
/// have the expected shape.
pub fn classify_text(text: &str) -> Option<Result<ControlMessage, WireError>> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return None,
    };

    let is_auth = value
        .as_object()
        .and_then(|object| object.get("type"))
        .and_then(|kind| kind.as_str())
        .map(|kind| kind == AUTH_TYPE)
        .unwrap_or(false);

    if !is_auth {
        return None;
    }

    trace!("Classified {} byte text payload as auth control message", text.len());
    Some(
        serde_json::from_value::<ControlMessage>(value)
            .map_err(|e| WireError::MalformedControl(e.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_message_wire_shape() {
        let encoded = ControlMessage::auth(12345u32).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["sharedSecret"], "12345");
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_classify_auth_message() {
        let classified = classify_text(r#"{"type": "auth", "sharedSecret": "987"}"#);
        match classified {
            Some(Ok(ControlMessage::Auth { public_value })) => assert_eq!(public_value, "987"),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_classify_passes_through_ordinary_payloads() {
        assert!(classify_text("hello world").is_none());
        assert!(classify_text("{'foo' : 'bar'}").is_none());
        assert!(classify_text(r#"{"type": "chat", "body": "hi"}"#).is_none());
        assert!(classify_text(r#"["auth"]"#).is_none());
        assert!(classify_text("42").is_none());
    }

    #[test]
    fn test_classify_malformed_auth_message() {
        let missing = classify_text(r#"{"type": "auth"}"#);
        assert!(matches!(missing, Some(Err(WireError::MalformedControl(_)))));

        let numeric = classify_text(r#"{"type": "auth", "sharedSecret": 5}"#);
        assert!(matches!(numeric, Some(Err(WireError::MalformedControl(_)))));
    }
}
