//! X25519 key types for Diffie-Hellman key exchange.
//!
//! Provides both static (long-term identity) and ephemeral (per-handshake)
//! keypairs. All secret key material is zeroized on drop.

use crate::error::{Error, Result};
use crate::logging::Redacted;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of X25519 keys in bytes.
pub const X25519_KEY_SIZE: usize = 32;

/// An X25519 public key for key exchange.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey([u8; X25519_KEY_SIZE]);

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, failing unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; X25519_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey("x25519 public key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519PublicKey({}...)", hex::encode(&self.0[..8]))
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(key: PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

impl From<[u8; X25519_KEY_SIZE]> for X25519PublicKey {
    fn from(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

/// A shared secret derived from X25519 key exchange.
///
/// Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; X25519_KEY_SIZE]);

impl SharedSecret {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// Run X25519 and reject the all-zero output produced by low-order points.
fn checked_dh(secret: &StaticSecret, their_public: &X25519PublicKey) -> Result<SharedSecret> {
    let shared = secret.diffie_hellman(&their_public.to_dalek());
    if !shared.was_contributory() {
        return Err(Error::Crypto("non-contributory DH output".into()));
    }
    Ok(SharedSecret(*shared.as_bytes()))
}

/// A long-term (static) X25519 keypair.
///
/// The peer fingerprint is the SHA-256 of its public half.
#[derive(Clone)]
pub struct StaticKeypair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// Perform Diffie-Hellman key exchange.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> Result<SharedSecret> {
        checked_dh(&self.secret, their_public)
    }

    /// Export secret key bytes for storage.
    pub fn secret_bytes(&self) -> zeroize::Zeroizing<[u8; X25519_KEY_SIZE]> {
        zeroize::Zeroizing::new(self.secret.to_bytes())
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public)
            .field("secret", &Redacted(()))
            .finish()
    }
}

/// An ephemeral X25519 keypair, used for a single handshake.
///
/// Uses `StaticSecret` internally because the XX pattern performs more than
/// one DH with the same ephemeral key (`ee` and `es`/`se`).
pub struct EphemeralKeypair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl EphemeralKeypair {
    /// Generate a new random ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// Perform Diffie-Hellman key exchange.
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> Result<SharedSecret> {
        checked_dh(&self.secret, their_public)
    }
}

impl fmt::Debug for EphemeralKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeypair")
            .field("public", &self.public)
            .field("secret", &Redacted(()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_agreement() {
        let alice = StaticKeypair::generate();
        let bob = StaticKeypair::generate();

        let alice_shared = alice.diffie_hellman(bob.public_key()).expect("dh");
        let bob_shared = bob.diffie_hellman(alice.public_key()).expect("dh");

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_mixed_dh() {
        let static_key = StaticKeypair::generate();
        let ephemeral_key = EphemeralKeypair::generate();

        let s1 = static_key.diffie_hellman(ephemeral_key.public_key()).expect("dh");
        let s2 = ephemeral_key.diffie_hellman(static_key.public_key()).expect("dh");

        assert_eq!(s1.as_bytes(), s2.as_bytes());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let kp = StaticKeypair::generate();
        let zero = X25519PublicKey::from_bytes([0u8; 32]);
        assert!(kp.diffie_hellman(&zero).is_err());
    }

    #[test]
    fn test_keypair_persistence() {
        let original = StaticKeypair::generate();
        let restored = StaticKeypair::from_secret_bytes(*original.secret_bytes());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_public_key_from_slice() {
        assert!(X25519PublicKey::from_slice(&[1u8; 32]).is_ok());
        assert!(X25519PublicKey::from_slice(&[1u8; 31]).is_err());
    }
}
