//! Diffie-Hellman key agreement and trust registry for wss peer authentication.
//!
//! Peers prove they are previously known by deriving the same verification
//! tag from a Diffie-Hellman exchange. Each side holds a [`KeyAgreement`]
//! (optionally persisted to a private key file) and a [`TrustRegistry`]
//! mapping known peer public values to the tag expected from them.
//!
//! This is a trust-on-first-use scheme for previously provisioned peers. It
//! does not encrypt anything and is not a substitute for TLS.
//!
//! ## Example
//!
//! ```rust
//! use wss_auth::{KeyAgreement, TrustRegistry};
//!
//! # fn example() -> Result<(), wss_auth::AuthError> {
//! let server = KeyAgreement::generate()?;
//! let client = KeyAgreement::generate()?;
//!
//! // Provisioning: the server learns the tag it expects from this client.
//! let expected = server.verification_tag(client.public_value())?;
//! let registry = TrustRegistry::from_entries([(client.public_value().clone(), expected)]);
//!
//! // Handshake: each side only ever sees the other's public value.
//! let computed = server.verification_tag(client.public_value())?;
//! registry.verify(client.public_value(), &computed)?;
//! assert_eq!(computed, client.verification_tag(server.public_value())?);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod key_agreement;
pub mod keyfile;
pub mod registry;

// Re-export main types
pub use error::AuthError;
pub use key_agreement::{
    default_modulus, generate_private_exponent, KeyAgreement, PublicValue, SharedSecret,
    VerificationTag, DEFAULT_GENERATOR, DEFAULT_PRIVATE_BITS, TAG_LEN,
};
pub use registry::TrustRegistry;
