//! Authentication error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by key agreement, key persistence, and peer verification
#[derive(Error, Debug)]
pub enum AuthError {
    /// Peer public value is zero, one, or outside the group
    #[error("invalid public value")]
    InvalidPublicValue,

    /// Auth control message could not be parsed
    #[error("malformed auth message: {0}")]
    MalformedAuthMessage(String),

    /// Peer is registered but produced a different verification tag
    #[error("verification failed for peer {peer}")]
    VerificationFailed {
        /// Fingerprint of the peer public value
        peer: String,
    },

    /// Peer public value is not in the trust registry
    #[error("unknown peer {peer}")]
    UnknownPeer {
        /// Fingerprint of the peer public value
        peer: String,
    },

    /// Trust registry file is missing or malformed
    #[error("trust registry {path:?} unreadable: {reason}")]
    RegistryUnreadable {
        /// Registry file path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Private key file exists but does not hold a decimal integer
    #[error("private key file {path:?} is corrupt")]
    KeyFileCorrupt {
        /// Key file path
        path: PathBuf,
    },

    /// I/O failure reading or writing the private key file
    #[error("private key file {path:?}: {source}")]
    KeyFile {
        /// Key file path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No cryptographic randomness could be obtained
    #[error("no entropy source available: {0}")]
    Entropy(String),

    /// Group or exponent parameters are unusable
    #[error("invalid key parameters: {0}")]
    InvalidParameters(String),
}

impl AuthError {
    /// Whether this error means the peer itself was rejected, as opposed to
    /// a local configuration or I/O problem
    pub fn is_peer_rejection(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidPublicValue
                | AuthError::MalformedAuthMessage(_)
                | AuthError::VerificationFailed { .. }
                | AuthError::UnknownPeer { .. }
        )
    }
}
