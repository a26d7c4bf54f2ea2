//! Trust registry: the verification tag expected from each known peer.
//!
//! The registry file is a JSON object mapping a peer's decimal public value to
//! the hex tag that peer must derive with us:
//!
//! ```json
//! { "2993...1187": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08" }
//! ```
//!
//! Entries are keyed by the raw public value rather than a stable identity, so
//! rotating a peer's key means re-provisioning its entry.

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::key_agreement::{PublicValue, VerificationTag};

/// Read-only map from peer public value to expected tag
#[derive(Debug, Clone, Default)]
pub struct TrustRegistry {
    entries: HashMap<String, VerificationTag>,
}

impl TrustRegistry {
    /// Empty registry; every peer is unknown
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry from already-decoded entries
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (PublicValue, VerificationTag)>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(peer, tag)| (peer.registry_key(), tag))
                .collect(),
        }
    }

    /// Load a registry file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let unreadable = |reason: String| AuthError::RegistryUnreadable {
            path: path.to_path_buf(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        let raw: HashMap<String, String> =
            serde_json::from_str(&content).map_err(|e| unreadable(e.to_string()))?;

        let mut entries = HashMap::with_capacity(raw.len());
        for (key, tag_hex) in raw {
            let tag = VerificationTag::from_hex(&tag_hex)
                .map_err(|e| unreadable(format!("bad tag for entry {}: {}", abbreviate(&key), e)))?;
            entries.insert(key, tag);
        }

        info!("Loaded {} trusted peers from {:?}", entries.len(), path);
        Ok(Self { entries })
    }

    /// Load a registry file, falling back to an empty registry if it cannot be
    /// read. The failure is logged, not returned.
    pub fn load_or_empty<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(registry) => registry,
            Err(e) => {
                warn!("{}; starting with an empty trust registry", e);
                Self::new()
            }
        }
    }

    /// Expected tag for a peer, if it is registered
    pub fn lookup(&self, peer: &PublicValue) -> Option<&VerificationTag> {
        self.lookup_key(&peer.registry_key())
    }

    /// Expected tag by raw registry key
    pub fn lookup_key(&self, key: &str) -> Option<&VerificationTag> {
        self.entries.get(key)
    }

    /// Decide whether `peer`, having derived `computed` with us, is trusted.
    ///
    /// Unknown peers are rejected even if `computed` matches some other
    /// entry.
    pub fn verify(&self, peer: &PublicValue, computed: &VerificationTag) -> Result<(), AuthError> {
        match self.lookup(peer) {
            Some(expected) if expected == computed => Ok(()),
            Some(_) => Err(AuthError::VerificationFailed {
                peer: peer.fingerprint(),
            }),
            None => {
                debug!(
                    "Registry entry that would trust peer {}: \"{}\": \"{}\",",
                    peer.fingerprint(),
                    peer.registry_key(),
                    computed.to_hex()
                );
                Err(AuthError::UnknownPeer {
                    peer: peer.fingerprint(),
                })
            }
        }
    }

    /// Number of trusted peers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no peer is trusted
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn abbreviate(key: &str) -> String {
    let count = key.chars().count();
    if count <= 16 {
        key.to_string()
    } else {
        format!("{}… ({} chars)", key.chars().take(16).collect::<String>(), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_agreement::KeyAgreement;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pair() -> (KeyAgreement, KeyAgreement) {
        (KeyAgreement::generate().unwrap(), KeyAgreement::generate().unwrap())
    }

    #[test]
    fn test_verify_outcomes() {
        let (server, client) = pair();
        let tag = server.verification_tag(client.public_value()).unwrap();
        let registry = TrustRegistry::from_entries([(client.public_value().clone(), tag)]);

        assert!(registry.verify(client.public_value(), &tag).is_ok());

        let wrong = VerificationTag::from_bytes([0u8; 32]);
        assert!(matches!(
            registry.verify(client.public_value(), &wrong),
            Err(AuthError::VerificationFailed { .. })
        ));

        // A stranger is unknown even when presenting a registered tag.
        let stranger = KeyAgreement::generate().unwrap();
        assert!(matches!(
            registry.verify(stranger.public_value(), &tag),
            Err(AuthError::UnknownPeer { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let (server, client) = pair();
        let tag = server.verification_tag(client.public_value()).unwrap();

        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "{{\"{}\": \"{}\"}}",
            client.public_value(),
            tag.to_hex().to_uppercase()
        )
        .unwrap();

        let registry = TrustRegistry::load(file.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(client.public_value()), Some(&tag));
        assert_eq!(registry.lookup_key(&client.public_value().to_string()), Some(&tag));
    }

    #[test]
    fn test_missing_file_is_unreadable() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = TrustRegistry::load(dir.path().join("clients.json"));
        assert!(matches!(result, Err(AuthError::RegistryUnreadable { .. })));

        let registry = TrustRegistry::load_or_empty(dir.path().join("clients.json"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_malformed_files_are_unreadable() {
        for content in ["not json", "[\"a\", \"b\"]", "{\"123\": 5}", "{\"123\": \"zz\"}"] {
            let mut file = NamedTempFile::new().unwrap();
            file.write_all(content.as_bytes()).unwrap();
            assert!(
                matches!(
                    TrustRegistry::load(file.path()),
                    Err(AuthError::RegistryUnreadable { .. })
                ),
                "content {:?} should be rejected",
                content
            );
        }
    }

    #[test]
    fn test_registries_are_independent() {
        let (_, client) = pair();
        let tag = VerificationTag::from_bytes([1u8; 32]);
        let populated = TrustRegistry::from_entries([(client.public_value().clone(), tag)]);
        let empty = TrustRegistry::new();

        assert_eq!(populated.len(), 1);
        assert!(empty.lookup(client.public_value()).is_none());
    }
}
