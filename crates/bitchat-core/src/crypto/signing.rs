//! Ed25519 packet signatures.
//!
//! The signing key is separate from the static Diffie-Hellman key.

use crate::error::{Error, Result};
use crate::logging::Redacted;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

/// Size of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

/// Size of an Ed25519 public or secret key.
pub const SIGNING_KEY_SIZE: usize = 32;

/// An Ed25519 keypair used to sign outgoing packets.
#[derive(Clone)]
pub struct SigningKeypair {
    signing_key: SigningKey,
}

impl SigningKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from the 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8; SIGNING_KEY_SIZE]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    /// Export the secret seed for storage.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; SIGNING_KEY_SIZE]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// The public verifying key bytes.
    pub fn public_key(&self) -> [u8; SIGNING_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &hex::encode(self.public_key()))
            .field("secret", &Redacted(()))
            .finish()
    }
}

/// Verify an Ed25519 signature.
pub fn verify_signature(
    public_key: &[u8; SIGNING_KEY_SIZE],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|_| Error::InvalidKey("invalid ed25519 public key".into()))?;
    let signature = Signature::from_bytes(signature);
    key.verify(message, &signature)
        .map_err(|_| Error::Crypto("signature verification failed".into()))
}
