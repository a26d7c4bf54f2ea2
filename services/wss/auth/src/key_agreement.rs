//! Diffie-Hellman key agreement over the RFC 3526 6144-bit MODP group.
//!
//! A [`KeyAgreement`] owns one private exponent and derives from it:
//!
//! - the [`PublicValue`] sent to peers (`g^x mod p`),
//! - the [`SharedSecret`] agreed with a peer (`peer^x mod p`),
//! - the [`VerificationTag`] compared against the trust registry
//!   (SHA-256 of the shared secret's decimal string).
//!
//! Secret material never appears in `Debug` output.

use num_bigint::BigUint;
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::error::AuthError;
use crate::keyfile;

/// Bits of entropy in a generated private exponent
pub const DEFAULT_PRIVATE_BITS: u64 = 576;

/// Generator of the default group
pub const DEFAULT_GENERATOR: u32 = 2;

/// Size of a verification tag in bytes
pub const TAG_LEN: usize = 32;

const MODP_6144_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33",
    "A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7",
    "ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864",
    "D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2",
    "08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A92108011A723C12A787E6D7",
    "88719A10BDBA5B2699C327186AF4E23C1A946834B6150BDA2583E9CA2AD44CE8",
    "DBBBC2DB04DE8EF92E8EFC141FBECAA6287C59474E6BC05D99B2964FA090C3A2",
    "233BA186515BE7ED1F612970CEE2D7AFB81BDD762170481CD0069127D5B05AA9",
    "93B4EA988D8FDDC186FFB7DC90A6C08F4DF435C93402849236C3FAB4D27C7026",
    "C1D4DCB2602646DEC9751E763DBA37BDF8FF9406AD9E530EE5DB382F413001AE",
    "B06A53ED9027D831179727B0865A8918DA3EDBEBCF9B14ED44CE6CBACED4BB1B",
    "DB7F1447E6CC254B332051512BD7AF426FB8F401378CD2BF5983CA01C64B92EC",
    "F032EA15D1721D03F482D7CE6E74FEF6D55E702F46980C82B5A84031900B1C9E",
    "59E7C97FBEC7E8F323A97A7E36CC88BE0F1D45B7FF585AC54BD407B22B4154AA",
    "CC8F6D7EBF48E1D814CC5ED20F8037E0A79715EEF29BE32806A1D58BB7C5DA76",
    "F550AA3D8A1FBFF0EB19CCB1A313D55CDA56C9EC2EF29632387FE8D76E3C0468",
    "043E8F663F4860EE12BF2D5B0B7474D6E694F91E6DCC4024FFFFFFFFFFFFFFFF",
);

static MODP_6144: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(MODP_6144_HEX.as_bytes(), 16).expect("MODP prime constant is valid hex")
});

/// The default group modulus
pub fn default_modulus() -> &'static BigUint {
    &MODP_6144
}

/// Generate a random private exponent of exactly `bits` bits.
///
/// Randomness comes from the operating system. There is no fallback to a
/// seeded or non-cryptographic generator: if the OS source fails, so does
/// this.
pub fn generate_private_exponent(bits: u64) -> Result<BigUint, AuthError> {
    if bits == 0 {
        return Err(AuthError::InvalidParameters(
            "private exponent must have at least one bit".to_string(),
        ));
    }

    let len = ((bits + 7) / 8) as usize;
    let excess = (len as u64 * 8 - bits) as u32;

    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AuthError::Entropy(e.to_string()))?;

    // Clear bits above the requested length, then pin the top bit so the
    // exponent has exactly `bits` bits.
    bytes[0] &= 0xffu8 >> excess;
    bytes[0] |= 0x80u8 >> excess;

    Ok(BigUint::from_bytes_be(&bytes))
}

/// Value announced to a peer. Not secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicValue(BigUint);

impl PublicValue {
    /// Underlying integer
    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Key under which this value is stored in the trust registry
    pub fn registry_key(&self) -> String {
        self.0.to_str_radix(10)
    }

    /// Short stable identifier for logs: first 8 bytes of SHA-256 over the
    /// decimal form, hex encoded
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.registry_key().as_bytes());
        hex::encode(&digest[..8])
    }
}

impl From<BigUint> for PublicValue {
    fn from(value: BigUint) -> Self {
        PublicValue(value)
    }
}

impl FromStr for PublicValue {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AuthError::MalformedAuthMessage(format!(
                "public value is not a decimal integer ({} chars)",
                s.len()
            )));
        }
        BigUint::parse_bytes(s.as_bytes(), 10)
            .map(PublicValue)
            .ok_or_else(|| AuthError::MalformedAuthMessage("public value is not a decimal integer".to_string()))
    }
}

impl fmt::Display for PublicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PublicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicValue({})", self.fingerprint())
    }
}

/// Value agreed with one peer. Never persisted or logged.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(BigUint);

impl SharedSecret {
    /// Tag that proves knowledge of this secret without revealing it
    pub fn verification_tag(&self) -> VerificationTag {
        let digest = Sha256::digest(self.0.to_str_radix(10).as_bytes());
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest);
        VerificationTag(tag)
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// SHA-256 digest of a shared secret's decimal form
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VerificationTag([u8; TAG_LEN]);

impl VerificationTag {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; TAG_LEN]) -> Self {
        VerificationTag(bytes)
    }

    /// Parse a hex string (either case)
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut tag = [0u8; TAG_LEN];
        hex::decode_to_slice(s.trim(), &mut tag)?;
        Ok(VerificationTag(tag))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }

    /// Lowercase hex encoding, as stored in the registry file
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for VerificationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for VerificationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerificationTag({})", self.to_hex())
    }
}

/// One side of a Diffie-Hellman exchange
#[derive(Clone)]
pub struct KeyAgreement {
    private_exponent: BigUint,
    modulus: BigUint,
    generator: BigUint,
    public_value: PublicValue,
}

impl KeyAgreement {
    /// Fresh key pair in the default group
    pub fn generate() -> Result<Self, AuthError> {
        Self::from_private_exponent(generate_private_exponent(DEFAULT_PRIVATE_BITS)?)
    }

    /// Key pair in the default group from a known private exponent
    pub fn from_private_exponent(private_exponent: BigUint) -> Result<Self, AuthError> {
        Self::with_group(
            default_modulus().clone(),
            BigUint::from(DEFAULT_GENERATOR),
            private_exponent,
        )
    }

    /// Key pair in an arbitrary group
    pub fn with_group(
        modulus: BigUint,
        generator: BigUint,
        private_exponent: BigUint,
    ) -> Result<Self, AuthError> {
        if modulus <= BigUint::from(3u32) {
            return Err(AuthError::InvalidParameters("modulus too small".to_string()));
        }
        if generator <= BigUint::one() || generator >= modulus {
            return Err(AuthError::InvalidParameters(
                "generator outside the group".to_string(),
            ));
        }
        if private_exponent.is_zero() {
            return Err(AuthError::InvalidParameters(
                "private exponent must be non-zero".to_string(),
            ));
        }

        let public_value = PublicValue(generator.modpow(&private_exponent, &modulus));
        Ok(Self {
            private_exponent,
            modulus,
            generator,
            public_value,
        })
    }

    /// Load the private exponent from `path`, creating the file with a fresh
    /// exponent if it does not exist yet.
    ///
    /// An existing file is never overwritten: a corrupt file is an error.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let private_exponent = keyfile::load_or_create(path.as_ref(), DEFAULT_PRIVATE_BITS)?;
        let agreement = Self::from_private_exponent(private_exponent)?;
        debug!(
            "Loaded key agreement from {:?} (public value {})",
            path.as_ref(),
            agreement.public_value.fingerprint()
        );
        Ok(agreement)
    }

    /// Value to announce to peers
    pub fn public_value(&self) -> &PublicValue {
        &self.public_value
    }

    /// Group modulus
    pub fn modulus(&self) -> &BigUint {
        &self.modulus
    }

    /// Group generator
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Reject peer values that are degenerate or outside the group
    pub fn validate_peer(&self, peer: &PublicValue) -> Result<(), AuthError> {
        let p_minus_one = &self.modulus - BigUint::one();
        if peer.0 <= BigUint::one() || peer.0 >= p_minus_one {
            return Err(AuthError::InvalidPublicValue);
        }
        Ok(())
    }

    /// Secret shared with the owner of `peer`
    pub fn shared_secret(&self, peer: &PublicValue) -> Result<SharedSecret, AuthError> {
        self.validate_peer(peer)?;
        Ok(SharedSecret(peer.0.modpow(&self.private_exponent, &self.modulus)))
    }

    /// Tag both sides derive for this pairing
    pub fn verification_tag(&self, peer: &PublicValue) -> Result<VerificationTag, AuthError> {
        Ok(self.shared_secret(peer)?.verification_tag())
    }
}

impl fmt::Debug for KeyAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAgreement")
            .field("modulus_bits", &self.modulus.bits())
            .field("generator", &self.generator)
            .field("public_value", &self.public_value)
            .field("private_exponent", &"<redacted>")
            .finish()
    }
}
