//! Cipher and symmetric state of the Noise framework.
//!
//! [`CipherState`] and [`SymmetricState`] follow the Noise framework
//! definitions and are only used while a handshake is in progress. After
//! `split` the two keys move into [`SendingCipher`] and [`ReceivingCipher`],
//! which put the nonce on the wire so packets that arrive over different
//! mesh paths can still be opened.

use crate::crypto::{decrypt, encrypt, hkdf2, sha256, HASH_SIZE, KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use std::fmt;
use zeroize::Zeroizing;

/// Size of the explicit nonce prefix on transport messages.
pub const TRANSPORT_NONCE_SIZE: usize = 8;

/// A key plus implicit nonce counter.
#[derive(Default)]
pub struct CipherState {
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    nonce: u64,
}

impl CipherState {
    /// Cipher state with no key: encryption is the identity function.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Cipher state with a fresh key and nonce zero.
    pub fn with_key(key: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        Self {
            key: Some(key),
            nonce: 0,
        }
    }

    /// Whether a key has been installed.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypt and advance the nonce. Plaintext passes through without a key.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };
        if self.nonce == u64::MAX {
            return Err(Error::NonceExhausted);
        }
        let ciphertext = encrypt(key, self.nonce, plaintext, ad)?;
        self.nonce += 1;
        Ok(ciphertext)
    }

    /// Decrypt and advance the nonce. The nonce only moves on success.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let Some(key) = &self.key else {
            return Ok(Zeroizing::new(ciphertext.to_vec()));
        };
        if self.nonce == u64::MAX {
            return Err(Error::NonceExhausted);
        }
        let plaintext = decrypt(key, self.nonce, ciphertext, ad)?;
        self.nonce += 1;
        Ok(plaintext)
    }
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("has_key", &self.has_key())
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// Chaining key, handshake hash and the current handshake cipher.
pub struct SymmetricState {
    ck: Zeroizing<[u8; HASH_SIZE]>,
    h: [u8; HASH_SIZE],
    cipher: CipherState,
}

impl SymmetricState {
    /// Initialize from a protocol name.
    ///
    /// Names up to 32 bytes are zero-padded, longer names are hashed.
    pub fn initialize(protocol_name: &[u8]) -> Self {
        let h = if protocol_name.len() <= HASH_SIZE {
            let mut h = [0u8; HASH_SIZE];
            h[..protocol_name.len()].copy_from_slice(protocol_name);
            h
        } else {
            sha256(protocol_name)
        };

        Self {
            ck: Zeroizing::new(h),
            h,
            cipher: CipherState::empty(),
        }
    }

    /// `h = SHA-256(h || data)`.
    pub fn mix_hash(&mut self, data: &[u8]) {
        let mut input = Vec::with_capacity(HASH_SIZE + data.len());
        input.extend_from_slice(&self.h);
        input.extend_from_slice(data);
        self.h = sha256(&input);
    }

    /// Fold DH output into the chaining key and rekey the handshake cipher.
    pub fn mix_key(&mut self, input_key_material: &[u8]) -> Result<()> {
        let (ck, temp_k) = hkdf2(self.ck.as_slice(), input_key_material)?;
        self.ck = ck;
        self.cipher = CipherState::with_key(temp_k);
        Ok(())
    }

    /// Encrypt with `h` as associated data, then hash the ciphertext.
    pub fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = self.cipher.encrypt_with_ad(&self.h, plaintext)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypt with `h` as associated data, then hash the ciphertext.
    pub fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = self.cipher.decrypt_with_ad(&self.h, ciphertext)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Bytes `encrypt_and_hash` adds to a plaintext of the given length.
    pub fn overhead(&self) -> usize {
        if self.cipher.has_key() {
            TAG_SIZE
        } else {
            0
        }
    }

    /// Derive the two transport keys. The first is initiator to responder.
    pub fn split(&self) -> Result<(Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>)> {
        hkdf2(self.ck.as_slice(), &[])
    }

    /// Current handshake hash.
    pub fn handshake_hash(&self) -> [u8; HASH_SIZE] {
        self.h
    }
}

impl fmt::Debug for SymmetricState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricState")
            .field("h", &hex::encode(&self.h[..8]))
            .field("cipher", &self.cipher)
            .finish()
    }
}

/// Outbound transport cipher.
pub struct SendingCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
    next_nonce: u64,
}

impl SendingCipher {
    /// Create with nonce zero.
    pub fn new(key: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        Self { key, next_nonce: 0 }
    }

    /// Encrypt a message as `nonce (8, BE) || ciphertext || tag`.
    ///
    /// Nonce `u64::MAX` is never used; reaching it means the session must be
    /// re-established.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.next_nonce == u64::MAX {
            return Err(Error::NonceExhausted);
        }
        let nonce = self.next_nonce;
        let ciphertext = encrypt(&self.key, nonce, plaintext, &[])?;
        self.next_nonce += 1;

        let mut out = Vec::with_capacity(TRANSPORT_NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// The nonce the next `seal` will use.
    pub fn next_nonce(&self) -> u64 {
        self.next_nonce
    }
}

impl fmt::Debug for SendingCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendingCipher")
            .field("next_nonce", &self.next_nonce)
            .finish()
    }
}

/// Inbound transport cipher.
///
/// Accepts any nonce strictly greater than the last accepted one.
pub struct ReceivingCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
    last_accepted: Option<u64>,
}

impl ReceivingCipher {
    /// Create with no nonce accepted yet.
    pub fn new(key: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        Self {
            key,
            last_accepted: None,
        }
    }

    /// Open a message produced by [`SendingCipher::seal`].
    pub fn open(&mut self, message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if message.len() < TRANSPORT_NONCE_SIZE + TAG_SIZE {
            return Err(Error::Crypto("transport message too short".into()));
        }
        let mut nonce_bytes = [0u8; TRANSPORT_NONCE_SIZE];
        nonce_bytes.copy_from_slice(&message[..TRANSPORT_NONCE_SIZE]);
        let nonce = u64::from_be_bytes(nonce_bytes);

        if nonce == u64::MAX {
            return Err(Error::Crypto("reserved nonce".into()));
        }
        if matches!(self.last_accepted, Some(last) if nonce <= last) {
            return Err(Error::Crypto("stale or replayed nonce".into()));
        }

        let plaintext = decrypt(&self.key, nonce, &message[TRANSPORT_NONCE_SIZE..], &[])?;
        self.last_accepted = Some(nonce);
        Ok(plaintext)
    }

    /// Highest nonce accepted so far.
    pub fn last_accepted(&self) -> Option<u64> {
        self.last_accepted
    }
}

impl fmt::Debug for ReceivingCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivingCipher")
            .field("last_accepted", &self.last_accepted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new([byte; KEY_SIZE])
    }

    #[test]
    fn test_empty_cipher_passthrough() {
        let mut cipher = CipherState::empty();
        assert_eq!(cipher.encrypt_with_ad(b"ad", b"plain").expect("encrypt"), b"plain");
        assert_eq!(&*cipher.decrypt_with_ad(b"ad", b"plain").expect("decrypt"), b"plain");
    }

    #[test]
    fn test_cipher_state_nonce_advances() {
        let mut tx = CipherState::with_key(key(7));
        let mut rx = CipherState::with_key(key(7));

        let c1 = tx.encrypt_with_ad(b"", b"one").expect("encrypt");
        let c2 = tx.encrypt_with_ad(b"", b"two").expect("encrypt");
        assert_ne!(c1, c2);

        // out of order fails because the implicit nonce does not match
        assert!(rx.decrypt_with_ad(b"", &c2).is_err());
        assert_eq!(&*rx.decrypt_with_ad(b"", &c1).expect("decrypt"), b"one");
        assert_eq!(&*rx.decrypt_with_ad(b"", &c2).expect("decrypt"), b"two");
    }

    #[test]
    fn test_cipher_state_exhaustion() {
        let mut cipher = CipherState::with_key(key(1));
        cipher.nonce = u64::MAX;
        assert!(matches!(
            cipher.encrypt_with_ad(b"", b"x"),
            Err(Error::NonceExhausted)
        ));
    }

    #[test]
    fn test_symmetric_state_initialize_short_name() {
        let state = SymmetricState::initialize(b"Noise_XX_25519_ChaChaPoly_SHA256");
        assert_eq!(&state.handshake_hash(), b"Noise_XX_25519_ChaChaPoly_SHA256");
        assert_eq!(*state.ck, state.handshake_hash());
    }

    #[test]
    fn test_symmetric_encrypt_and_hash_agree() {
        let mut a = SymmetricState::initialize(b"test");
        let mut b = SymmetricState::initialize(b"test");
        a.mix_key(b"shared").expect("mix");
        b.mix_key(b"shared").expect("mix");

        let ct = a.encrypt_and_hash(b"payload").expect("encrypt");
        assert_eq!(ct.len(), b"payload".len() + a.overhead());
        let pt = b.decrypt_and_hash(&ct).expect("decrypt");
        assert_eq!(&*pt, b"payload");
        assert_eq!(a.handshake_hash(), b.handshake_hash());
    }

    #[test]
    fn test_transport_seal_open() {
        let mut tx = SendingCipher::new(key(3));
        let mut rx = ReceivingCipher::new(key(3));

        let m0 = tx.seal(b"first").expect("seal");
        let m1 = tx.seal(b"second").expect("seal");
        assert_eq!(&m0[..8], &0u64.to_be_bytes());
        assert_eq!(&m1[..8], &1u64.to_be_bytes());

        assert_eq!(&*rx.open(&m0).expect("open"), b"first");
        assert_eq!(&*rx.open(&m1).expect("open"), b"second");
        assert_eq!(rx.last_accepted(), Some(1));
    }

    #[test]
    fn test_transport_rejects_replay_and_reorder() {
        let mut tx = SendingCipher::new(key(3));
        let mut rx = ReceivingCipher::new(key(3));

        let m0 = tx.seal(b"a").expect("seal");
        let m1 = tx.seal(b"b").expect("seal");
        let m2 = tx.seal(b"c").expect("seal");

        // gaps are fine
        assert!(rx.open(&m2).is_ok());
        // older and repeated nonces are not
        assert!(rx.open(&m0).is_err());
        assert!(rx.open(&m1).is_err());
        assert!(rx.open(&m2).is_err());
    }

    #[test]
    fn test_transport_failed_open_keeps_window() {
        let mut tx = SendingCipher::new(key(3));
        let mut rx = ReceivingCipher::new(key(3));

        let mut forged = tx.seal(b"a").expect("seal");
        let genuine = forged.clone();
        let last = forged.len() - 1;
        forged[last] ^= 1;

        assert!(rx.open(&forged).is_err());
        assert_eq!(rx.last_accepted(), None);
        assert!(rx.open(&genuine).is_ok());
    }

    #[test]
    fn test_transport_nonce_exhaustion() {
        let mut tx = SendingCipher::new(key(3));
        tx.next_nonce = u64::MAX - 1;
        assert!(tx.seal(b"last").is_ok());
        assert!(matches!(tx.seal(b"one more"), Err(Error::NonceExhausted)));
    }

    #[test]
    fn test_transport_wrong_key() {
        let mut tx = SendingCipher::new(key(3));
        let mut rx = ReceivingCipher::new(key(4));
        let msg = tx.seal(b"secret").expect("seal");
        assert!(rx.open(&msg).is_err());
        assert!(rx.open(&[0u8; 10]).is_err());
    }
}
