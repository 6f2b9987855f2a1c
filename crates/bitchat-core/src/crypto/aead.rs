//! Authenticated encryption using ChaCha20-Poly1305.
//!
//! Nonces are never random here: every key is used by exactly one Noise
//! cipher state, which supplies a counter. [`noise_nonce`] builds the
//! 96-bit nonce from that counter the way Noise does
//! (four zero bytes followed by the little-endian counter).

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use zeroize::Zeroizing;

/// Size of encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// Build a ChaCha20-Poly1305 nonce from a 64-bit counter.
pub fn noise_nonce(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt plaintext, returning ciphertext with the appended tag.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    counter: u64,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = noise_nonce(counter);

    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("encryption failed".into()))
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// Returns a generic error on failure to prevent oracle attacks.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    counter: u64,
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Crypto("ciphertext too short".into()));
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = noise_nonce(counter);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("decryption failed".into()))?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [42u8; KEY_SIZE];
        let plaintext = b"Hello, mesh!";
        let aad = b"transcript hash";

        let ciphertext = encrypt(&key, 0, plaintext, aad).expect("encrypt");
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = decrypt(&key, 0, &ciphertext, aad).expect("decrypt");
        assert_eq!(&*decrypted, plaintext);
    }

    #[test]
    fn test_wrong_counter_fails() {
        let key = [42u8; KEY_SIZE];
        let ciphertext = encrypt(&key, 5, b"secret", b"").expect("encrypt");
        assert!(decrypt(&key, 6, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = [42u8; KEY_SIZE];
        let ciphertext = encrypt(&key, 0, b"secret", b"correct").expect("encrypt");
        assert!(decrypt(&key, 0, &ciphertext, b"wrong").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_SIZE];
        let mut ciphertext = encrypt(&key, 0, b"secret", b"").expect("encrypt");
        ciphertext[0] ^= 0xFF;
        assert!(decrypt(&key, 0, &ciphertext, b"").is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = [42u8; KEY_SIZE];
        assert!(decrypt(&key, 0, &[0u8; TAG_SIZE - 1], b"").is_err());
    }

    #[test]
    fn test_noise_nonce_layout() {
        let nonce = noise_nonce(1);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(nonce[4], 1);
        assert!(nonce[5..].iter().all(|&b| b == 0));
    }
}
