//! Cryptographic primitives for the BitChat protocol.
//!
//! Thin, narrow wrappers over audited crates:
//!
//! - **X25519**: Diffie-Hellman (`x25519-dalek`)
//! - **Ed25519**: packet signatures (`ed25519-dalek`)
//! - **ChaCha20-Poly1305**: AEAD (`chacha20poly1305`)
//! - **SHA-256 / HKDF-SHA256**: hashing and key derivation (`sha2`, `hkdf`)
//!
//! Nothing in this module implements curve or cipher arithmetic itself.

mod aead;
mod keys;
mod signing;

pub use aead::{decrypt, encrypt, noise_nonce, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use keys::{
    EphemeralKeypair, SharedSecret, StaticKeypair, X25519PublicKey, X25519_KEY_SIZE,
};
pub use signing::{verify_signature, SigningKeypair, SIGNATURE_SIZE, SIGNING_KEY_SIZE};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// SHA-256 output size.
pub const HASH_SIZE: usize = 32;

/// Hash arbitrary bytes with SHA-256.
pub fn sha256(data: &[u8]) -> [u8; HASH_SIZE] {
    Sha256::digest(data).into()
}

/// Derive two 32-byte outputs with HKDF-SHA256.
///
/// `salt` is used as the HKDF salt and `input_key_material` as the IKM with
/// an empty info string, which makes the result identical to the Noise
/// `HKDF(ck, ikm)` construction.
pub fn hkdf2(
    salt: &[u8],
    input_key_material: &[u8],
) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>)> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), input_key_material);
    let mut okm = Zeroizing::new([0u8; 64]);
    hkdf.expand(&[], okm.as_mut_slice())
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;

    let mut first = Zeroizing::new([0u8; 32]);
    let mut second = Zeroizing::new([0u8; 32]);
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    Ok((first, second))
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf2_deterministic() {
        let (a1, a2) = hkdf2(b"chaining key", b"ikm").expect("derive");
        let (b1, b2) = hkdf2(b"chaining key", b"ikm").expect("derive");
        assert_eq!(*a1, *b1);
        assert_eq!(*a2, *b2);
        assert_ne!(*a1, *a2);

        let (c1, _) = hkdf2(b"other key", b"ikm").expect("derive");
        assert_ne!(*a1, *c1);
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_random_bytes() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }
}
