//! Peer authentication over an open connection.
//!
//! Both sides announce their public value in an `auth` control message as soon
//! as the connection opens. On receiving the peer's announcement each side
//! derives the verification tag and checks it against its trust registry. A
//! peer that fails is disconnected with [`CloseCode::POLICY`].
//!
//! ```text
//! AwaitingPeerValue --auth--> Verifying --match--> Authenticated
//!                                       \--else--> Rejected
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wss_auth::{AuthError, KeyAgreement, PublicValue, TrustRegistry};
use wss_wire::{classify_text, ControlMessage, Frame};

use crate::error::SessionError;
use crate::transport::ConnectionHandle;

/// Where an endpoint keeps its authentication material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// Private exponent file, created on first use
    pub private_key_file: PathBuf,
    /// Trust registry file
    pub registry_file: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            private_key_file: PathBuf::from("dhserver.key"),
            registry_file: PathBuf::from("clients.json"),
        }
    }
}

/// Key and registry shared by every connection of one endpoint
#[derive(Debug, Clone)]
pub struct AuthContext {
    key: Arc<KeyAgreement>,
    registry: Arc<TrustRegistry>,
}

impl AuthContext {
    /// Context from an existing key and registry
    pub fn new(key: KeyAgreement, registry: TrustRegistry) -> Self {
        Self {
            key: Arc::new(key),
            registry: Arc::new(registry),
        }
    }

    /// Load (or create) the private key file and load the registry file. A
    /// missing or unreadable registry leaves every peer unknown; a key problem
    /// is an error.
    pub fn from_files(private_key_file: &Path, registry_file: &Path) -> Result<Self, AuthError> {
        let key = KeyAgreement::load_or_create(private_key_file)?;
        let registry = TrustRegistry::load_or_empty(registry_file);
        info!(
            "Authentication enabled: public value {} with {} trusted peers",
            key.public_value().fingerprint(),
            registry.len()
        );
        Ok(Self::new(key, registry))
    }

    /// Load the files named by `config`
    pub fn load(config: &AuthConfig) -> Result<Self, AuthError> {
        Self::from_files(&config.private_key_file, &config.registry_file)
    }

    /// Local key agreement
    pub fn key(&self) -> &KeyAgreement {
        &self.key
    }

    /// Trust registry
    pub fn registry(&self) -> &TrustRegistry {
        &self.registry
    }

    /// The `auth` frame announcing our public value
    pub fn announcement(&self) -> Result<Frame, SessionError> {
        Ok(ControlMessage::auth(self.key.public_value()).to_frame()?)
    }

    /// Verify a peer's announced public value
    pub fn verify(&self, announced: &str) -> Result<PublicValue, AuthError> {
        let peer: PublicValue = announced.parse()?;
        let computed = self.key.verification_tag(&peer)?;
        self.registry.verify(&peer, &computed)?;
        Ok(peer)
    }
}

/// Where a connection is in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Our announcement is out; waiting for the peer's
    AwaitingPeerValue,
    /// Peer value received and being checked
    Verifying,
    /// Peer verified
    Authenticated,
    /// Peer failed verification
    Rejected,
}

/// What to do with an inbound frame
#[derive(Debug)]
pub enum Step {
    /// Hand the frame to the application
    Deliver(Frame),
    /// The frame was the peer's announcement and it verified
    Authenticated(PublicValue),
    /// The peer failed; close the connection
    Reject(AuthError),
    /// Payload from a peer that has not authenticated yet, withheld by the
    /// dispatch gate
    Withheld(Frame),
    /// Repeated announcement after authentication; dropped
    Ignored,
}

/// Per-connection handshake state
#[derive(Debug)]
pub struct Handshake {
    context: AuthContext,
    state: AuthState,
    gate_dispatch: bool,
}

impl Handshake {
    /// Handshake for one connection. With `gate_dispatch`, payloads arriving
    /// before authentication are withheld from the application.
    pub fn new(context: AuthContext, gate_dispatch: bool) -> Self {
        Self {
            context,
            state: AuthState::AwaitingPeerValue,
            gate_dispatch,
        }
    }

    /// Send our announcement
    pub fn start(&mut self, connection: &ConnectionHandle) -> Result<(), SessionError> {
        connection.send(self.context.announcement()?)?;
        self.state = AuthState::AwaitingPeerValue;
        debug!("Sent public value to {}", connection.peer());
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Whether the peer has been verified
    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    /// Classify an inbound frame, advancing the handshake if it is an `auth`
    /// control message
    pub fn process(&mut self, frame: Frame) -> Step {
        let control = match &frame {
            Frame::Text(text) => classify_text(text),
            Frame::Binary(_) => None,
        };

        match control {
            None if self.gate_dispatch && !self.is_authenticated() => Step::Withheld(frame),
            None => Step::Deliver(frame),
            Some(_) if self.is_authenticated() => {
                warn!("Ignoring repeated auth message from an authenticated peer");
                Step::Ignored
            }
            Some(Err(e)) => {
                self.state = AuthState::Rejected;
                Step::Reject(AuthError::MalformedAuthMessage(e.to_string()))
            }
            Some(Ok(ControlMessage::Auth { public_value })) => {
                self.state = AuthState::Verifying;
                match self.context.verify(&public_value) {
                    Ok(peer) => {
                        self.state = AuthState::Authenticated;
                        Step::Authenticated(peer)
                    }
                    Err(e) => {
                        self.state = AuthState::Rejected;
                        Step::Reject(e)
                    }
                }
            }
        }
    }
}
