//! Identity management for BitChat nodes.
//!
//! A node identity is two independent keypairs:
//!
//! - a static X25519 keypair, used in the Noise handshake
//! - an Ed25519 signing keypair, used to sign packets
//!
//! The fingerprint is the SHA-256 of the static public key and the
//! [`PeerId`] carried in every packet is its first eight bytes. Keys never
//! change for the lifetime of an [`Identity`]; generating a new identity
//! produces a new fingerprint, which every other node treats as a new,
//! unknown peer.

mod store;
mod trust;

pub use store::{load_or_generate, IdentityStore, MemoryIdentityStore};
pub use trust::{Peer, PeerUpdate, TrustLevel, TrustStore};

use crate::crypto::{sha256, SigningKeypair, StaticKeypair, X25519PublicKey, HASH_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a peer identifier on the wire.
pub const PEER_ID_SIZE: usize = 8;

/// 8-byte peer identifier: the truncated fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Truncate a fingerprint.
    pub fn from_fingerprint(fingerprint: &Fingerprint) -> Self {
        let mut id = [0u8; PEER_ID_SIZE];
        id.copy_from_slice(&fingerprint.0[..PEER_ID_SIZE]);
        Self(id)
    }

    /// Derive the identifier a static public key must use.
    pub fn from_static_key(key: &X25519PublicKey) -> Self {
        Self::from_fingerprint(&Fingerprint::of(key))
    }

    /// Parse from a 16-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::Identity("invalid peer id hex".into()))?;
        let arr: [u8; PEER_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Identity("peer id must be 8 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

/// SHA-256 fingerprint of a static public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; HASH_SIZE]);

impl Fingerprint {
    /// Fingerprint a static public key.
    pub fn of(key: &X25519PublicKey) -> Self {
        Self(sha256(key.as_bytes()))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Hex string split into groups of 4 characters for verbal comparison.
    pub fn formatted(&self) -> String {
        hex::encode(self.0)
            .as_bytes()
            .chunks(4)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", hex::encode(&self.0[..8]))
    }
}

/// This node's long-term keys.
#[derive(Clone)]
pub struct Identity {
    static_keypair: StaticKeypair,
    signing_keypair: SigningKeypair,
    fingerprint: Fingerprint,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self::from_keypairs(StaticKeypair::generate(), SigningKeypair::generate())
    }

    /// Assemble an identity from existing keypairs.
    pub fn from_keypairs(static_keypair: StaticKeypair, signing_keypair: SigningKeypair) -> Self {
        let fingerprint = Fingerprint::of(static_keypair.public_key());
        Self {
            static_keypair,
            signing_keypair,
            fingerprint,
        }
    }

    /// Restore from stored secret bytes.
    pub fn from_secret_bytes(static_secret: &[u8], signing_secret: &[u8]) -> Result<Self> {
        let static_secret: [u8; 32] = static_secret
            .try_into()
            .map_err(|_| Error::Identity("static secret must be 32 bytes".into()))?;
        let signing_secret: [u8; 32] = signing_secret
            .try_into()
            .map_err(|_| Error::Identity("signing secret must be 32 bytes".into()))?;

        Ok(Self::from_keypairs(
            StaticKeypair::from_secret_bytes(static_secret),
            SigningKeypair::from_secret_bytes(&signing_secret),
        ))
    }

    /// The static Diffie-Hellman keypair.
    pub fn static_keypair(&self) -> &StaticKeypair {
        &self.static_keypair
    }

    /// The packet signing keypair.
    pub fn signing_keypair(&self) -> &SigningKeypair {
        &self.signing_keypair
    }

    /// The static public key.
    pub fn static_public_key(&self) -> &X25519PublicKey {
        self.static_keypair.public_key()
    }

    /// The Ed25519 public key.
    pub fn signing_public_key(&self) -> [u8; 32] {
        self.signing_keypair.public_key()
    }

    /// SHA-256 fingerprint of the static public key.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The identifier placed in the `sender_id` field of our packets.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_fingerprint(&self.fingerprint)
    }

    /// Sign bytes with the identity's signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_keypair.sign(message)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_identity() {
        let identity = Identity::generate();
        let expected = Fingerprint(sha256(identity.static_public_key().as_bytes()));
        assert_eq!(identity.fingerprint(), &expected);
        assert_eq!(identity.peer_id().as_bytes(), &expected.as_bytes()[..8]);
    }

    #[test]
    fn test_identity_persistence() {
        let id1 = Identity::generate();
        let static_secret = id1.static_keypair().secret_bytes();
        let signing_secret = id1.signing_keypair().secret_bytes();

        let id2 = Identity::from_secret_bytes(&*static_secret, &*signing_secret).expect("restore");

        assert_eq!(id1.fingerprint(), id2.fingerprint());
        assert_eq!(id1.signing_public_key(), id2.signing_public_key());
    }

    #[test]
    fn test_fresh_identity_is_fresh_peer() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = Identity::generate().peer_id();
        assert_eq!(PeerId::from_hex(&id.to_string()).expect("parse"), id);
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex("zz").is_err());
    }

    #[test]
    fn test_fingerprint_formatting() {
        let fp = Fingerprint([0xa1; 32]);
        let formatted = fp.formatted();
        assert_eq!(formatted.split(' ').count(), 16);
        assert!(formatted.starts_with("a1a1 a1a1"));
    }

    #[test]
    fn test_restore_rejects_bad_lengths() {
        assert!(Identity::from_secret_bytes(&[0u8; 31], &[0u8; 32]).is_err());
        assert!(Identity::from_secret_bytes(&[0u8; 32], &[0u8; 33]).is_err());
    }
}
