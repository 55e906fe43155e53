//! # Identity Primitives
//!
//! This module defines the identity types used throughout profilemesh:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as a node's or principal's identifier
//! - [`Contact`]: how to reach a node (identity plus network addresses)
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key.** A node is identified by the public key
//! of its node keypair; the same key backs the node's TLS certificate, so a
//! remote caller's identity is whatever its certificate proves, never a field
//! it claims in a message.
//!
//! The controlling principal of a node (its *owner*) is also an [`Identity`].
//! By default it is the node's own identity; a node may instead be owned by a
//! separate key that administers it remotely.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(bytes).as_bytes() == bytes`
//! - Only valid Ed25519 points pass [`Identity::is_valid`]
//! - A [`Contact`] is an unauthenticated hint; it is only trusted once the
//!   transport has verified the identity it names

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Maximum number of addresses accepted in a contact.
const MAX_CONTACT_ADDRS: usize = 8;

/// Maximum length of a single address string.
const MAX_ADDR_LEN: usize = 256;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short hex prefix used in log fields.
    #[inline]
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check if this identity is a usable Ed25519 public key.
    ///
    /// Rejects the all-zero and all-0xFF patterns outright, then requires the
    /// bytes to decode as a curve point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Identity {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Identity> for [u8; 32] {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reachability record for a node: its identity and where to dial it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub identity: Identity,
    pub addrs: Vec<String>,
}

impl Contact {
    pub fn new(identity: Identity, addrs: Vec<String>) -> Self {
        Self { identity, addrs }
    }

    /// Create a contact with a single address.
    pub fn single(identity: Identity, addr: impl Into<String>) -> Self {
        Self::new(identity, vec![addr.into()])
    }

    /// Get the primary address (first in the list).
    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }

    /// Bounds check for contacts received from the network.
    ///
    /// SECURITY: contacts are stored in the peer book, so their size must be
    /// bounded before they are accepted.
    pub fn validate_structure(&self) -> bool {
        if self.addrs.len() > MAX_CONTACT_ADDRS {
            return false;
        }
        self.addrs
            .iter()
            .all(|addr| !addr.is_empty() && addr.len() <= MAX_ADDR_LEN)
    }
}

/// Parses `IDENTITY@HOST:PORT`.
impl FromStr for Contact {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (id_part, addr_part) = s
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("contact must have the form IDENTITY@HOST:PORT"))?;
        let identity = Identity::from_hex(id_part)
            .map_err(|e| anyhow::anyhow!("invalid hex identity: {}", e))?;
        let addr: std::net::SocketAddr = addr_part
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid socket address {}: {}", addr_part, e))?;
        Ok(Contact::single(identity, addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_roundtrips_through_hex() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();

        let parsed = Identity::from_hex(&identity.to_hex()).expect("hex parse");
        assert_eq!(parsed, identity);
        assert_eq!(*parsed.as_bytes(), keypair.public_key_bytes());
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex(&"00".repeat(33)).is_err());
        assert!(Identity::from_hex("zz").is_err());
    }

    #[test]
    fn secret_key_bytes_restore_same_identity() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(restored.identity(), keypair.identity());
    }

    #[test]
    fn is_valid_rejects_invalid_ed25519_points() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
        assert!(Keypair::generate().identity().is_valid());
    }

    #[test]
    fn contact_parses_identity_at_address() {
        let identity = Keypair::generate().identity();
        let contact: Contact = format!("{}@127.0.0.1:4433", identity.to_hex())
            .parse()
            .expect("contact parse");

        assert_eq!(contact.identity, identity);
        assert_eq!(contact.primary_addr(), Some("127.0.0.1:4433"));
    }

    #[test]
    fn contact_parse_rejects_malformed_input() {
        let identity = Keypair::generate().identity();
        assert!("127.0.0.1:4433".parse::<Contact>().is_err());
        assert!(format!("{}@not-an-addr", identity).parse::<Contact>().is_err());
        assert!("beef@127.0.0.1:4433".parse::<Contact>().is_err());
    }

    #[test]
    fn structure_validation_limits() {
        let identity = Keypair::generate().identity();

        let too_many: Vec<String> = (0..20).map(|i| format!("10.0.0.{}:8080", i)).collect();
        assert!(!Contact::new(identity, too_many).validate_structure());
        assert!(!Contact::single(identity, "a".repeat(300)).validate_structure());
        assert!(!Contact::single(identity, "").validate_structure());
        assert!(Contact::single(identity, "10.0.0.1:8080").validate_structure());
    }
}
