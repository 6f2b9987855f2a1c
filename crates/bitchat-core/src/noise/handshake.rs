//! The XX handshake state machine.
//!
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! Each side calls `write_message`/`read_message` alternately. Any DH,
//! decryption or ordering error moves the state to
//! [`HandshakePhase::Failed`], which is terminal.

use super::state::{ReceivingCipher, SendingCipher, SymmetricState};
use super::PROTOCOL_NAME;
use crate::crypto::{EphemeralKeypair, StaticKeypair, X25519PublicKey, HASH_SIZE, TAG_SIZE, X25519_KEY_SIZE};
use crate::error::{Error, Result};
use std::fmt;
use zeroize::Zeroizing;

/// Which side of the handshake this state plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends message 1.
    Initiator,
    /// Answers message 1.
    Responder,
}

/// Progress through the three-message pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// Nothing sent or received.
    Uninitialized,
    /// Responder read message 1 and must write message 2.
    ReadyToRespond,
    /// Initiator sent message 1.
    AwaitingMessage2,
    /// Initiator read message 2 and must write message 3.
    ReadyToFinish,
    /// Responder sent message 2.
    AwaitingMessage3,
    /// Both sides authenticated. Ready to split.
    Complete,
    /// Aborted. Terminal.
    Failed,
}

/// One side of an in-progress XX handshake.
pub struct HandshakeState {
    role: Role,
    phase: HandshakePhase,
    step: u8,
    symmetric: SymmetricState,
    s: StaticKeypair,
    e: Option<EphemeralKeypair>,
    re: Option<X25519PublicKey>,
    rs: Option<X25519PublicKey>,
}

impl HandshakeState {
    /// Start a handshake with our static keypair.
    pub fn new(role: Role, local_static: StaticKeypair) -> Self {
        let mut symmetric = SymmetricState::initialize(PROTOCOL_NAME);
        // empty prologue
        symmetric.mix_hash(&[]);
        Self {
            role,
            phase: HandshakePhase::Uninitialized,
            step: 0,
            symmetric,
            s: local_static,
            e: None,
            re: None,
            rs: None,
        }
    }

    /// Shorthand for an initiator.
    pub fn initiator(local_static: StaticKeypair) -> Self {
        Self::new(Role::Initiator, local_static)
    }

    /// Shorthand for a responder.
    pub fn responder(local_static: StaticKeypair) -> Self {
        Self::new(Role::Responder, local_static)
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Number of handshake messages processed, 0 to 3.
    pub fn step(&self) -> u8 {
        self.step
    }

    /// Whether all three messages were processed.
    pub fn is_complete(&self) -> bool {
        self.phase == HandshakePhase::Complete
    }

    /// Whether the handshake aborted.
    pub fn is_failed(&self) -> bool {
        self.phase == HandshakePhase::Failed
    }

    /// The peer's static key, once it has been decrypted.
    pub fn remote_static(&self) -> Option<&X25519PublicKey> {
        self.rs.as_ref()
    }

    /// Produce the next handshake message carrying `payload`.
    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let result = match (self.role, self.phase) {
            (Role::Initiator, HandshakePhase::Uninitialized) => self.write_message_1(payload),
            (Role::Responder, HandshakePhase::ReadyToRespond) => self.write_message_2(payload),
            (Role::Initiator, HandshakePhase::ReadyToFinish) => self.write_message_3(payload),
            (_, phase) => Err(Error::HandshakeFailed(format!(
                "cannot write in phase {:?}",
                phase
            ))),
        };
        self.settle(result)
    }

    /// Consume the peer's handshake message and return its payload.
    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let result = match (self.role, self.phase) {
            (Role::Responder, HandshakePhase::Uninitialized) => self.read_message_1(message),
            (Role::Initiator, HandshakePhase::AwaitingMessage2) => self.read_message_2(message),
            (Role::Responder, HandshakePhase::AwaitingMessage3) => self.read_message_3(message),
            (_, phase) => Err(Error::HandshakeFailed(format!(
                "unexpected message in phase {:?}",
                phase
            ))),
        };
        self.settle(result.map(|payload| payload.to_vec()))
    }

    /// Derive the transport ciphers. Only valid once complete.
    pub fn into_transport(self) -> Result<TransportState> {
        if self.phase != HandshakePhase::Complete {
            return Err(Error::HandshakeFailed(format!(
                "cannot split in phase {:?}",
                self.phase
            )));
        }
        let remote_static = self
            .rs
            .ok_or_else(|| Error::HandshakeFailed("remote static key missing".into()))?;

        let (initiator_to_responder, responder_to_initiator) = self.symmetric.split()?;
        let (send_key, recv_key) = match self.role {
            Role::Initiator => (initiator_to_responder, responder_to_initiator),
            Role::Responder => (responder_to_initiator, initiator_to_responder),
        };

        Ok(TransportState {
            sender: SendingCipher::new(send_key),
            receiver: ReceivingCipher::new(recv_key),
            remote_static,
            handshake_hash: self.symmetric.handshake_hash(),
        })
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.phase = HandshakePhase::Failed;
                self.e = None;
                Err(match e {
                    Error::HandshakeFailed(reason) => Error::HandshakeFailed(reason),
                    other => Error::HandshakeFailed(other.to_string()),
                })
            }
        }
    }

    fn ephemeral(&self) -> Result<&EphemeralKeypair> {
        self.e
            .as_ref()
            .ok_or_else(|| Error::HandshakeFailed("local ephemeral key missing".into()))
    }

    fn remote_ephemeral(&self) -> Result<X25519PublicKey> {
        self.re
            .ok_or_else(|| Error::HandshakeFailed("remote ephemeral key missing".into()))
    }

    fn read_public_key(bytes: &[u8]) -> Result<X25519PublicKey> {
        X25519PublicKey::from_slice(bytes)
            .map_err(|_| Error::HandshakeFailed("bad public key length".into()))
    }

    // -> e
    fn write_message_1(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let e = EphemeralKeypair::generate();
        let mut out = e.public_key().as_bytes().to_vec();
        self.symmetric.mix_hash(e.public_key().as_bytes());
        self.e = Some(e);

        out.extend(self.symmetric.encrypt_and_hash(payload)?);
        self.phase = HandshakePhase::AwaitingMessage2;
        self.step = 1;
        Ok(out)
    }

    fn read_message_1(&mut self, message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if message.len() < X25519_KEY_SIZE {
            return Err(Error::HandshakeFailed("message 1 too short".into()));
        }
        let (re_bytes, rest) = message.split_at(X25519_KEY_SIZE);
        let re = Self::read_public_key(re_bytes)?;
        self.symmetric.mix_hash(re.as_bytes());
        self.re = Some(re);

        let payload = self.symmetric.decrypt_and_hash(rest)?;
        self.phase = HandshakePhase::ReadyToRespond;
        self.step = 1;
        Ok(payload)
    }

    // <- e, ee, s, es
    fn write_message_2(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let re = self.remote_ephemeral()?;
        let e = EphemeralKeypair::generate();
        let mut out = e.public_key().as_bytes().to_vec();
        self.symmetric.mix_hash(e.public_key().as_bytes());

        let ee = e.diffie_hellman(&re)?;
        self.symmetric.mix_key(ee.as_bytes())?;
        self.e = Some(e);

        let s_public = *self.s.public_key();
        out.extend(self.symmetric.encrypt_and_hash(s_public.as_bytes())?);

        let es = self.s.diffie_hellman(&re)?;
        self.symmetric.mix_key(es.as_bytes())?;

        out.extend(self.symmetric.encrypt_and_hash(payload)?);
        self.phase = HandshakePhase::AwaitingMessage3;
        self.step = 2;
        Ok(out)
    }

    fn read_message_2(&mut self, message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let encrypted_static_len = X25519_KEY_SIZE + TAG_SIZE;
        if message.len() < X25519_KEY_SIZE + encrypted_static_len + TAG_SIZE {
            return Err(Error::HandshakeFailed("message 2 too short".into()));
        }
        let (re_bytes, rest) = message.split_at(X25519_KEY_SIZE);
        let (encrypted_static, encrypted_payload) = rest.split_at(encrypted_static_len);

        let re = Self::read_public_key(re_bytes)?;
        self.symmetric.mix_hash(re.as_bytes());
        self.re = Some(re);

        let ee = self.ephemeral()?.diffie_hellman(&re)?;
        self.symmetric.mix_key(ee.as_bytes())?;

        let rs_bytes = self.symmetric.decrypt_and_hash(encrypted_static)?;
        let rs = Self::read_public_key(&rs_bytes)?;
        self.rs = Some(rs);

        let es = self.ephemeral()?.diffie_hellman(&rs)?;
        self.symmetric.mix_key(es.as_bytes())?;

        let payload = self.symmetric.decrypt_and_hash(encrypted_payload)?;
        self.phase = HandshakePhase::ReadyToFinish;
        self.step = 2;
        Ok(payload)
    }

    // -> s, se
    fn write_message_3(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let re = self.remote_ephemeral()?;
        let s_public = *self.s.public_key();
        let mut out = self.symmetric.encrypt_and_hash(s_public.as_bytes())?;

        let se = self.s.diffie_hellman(&re)?;
        self.symmetric.mix_key(se.as_bytes())?;

        out.extend(self.symmetric.encrypt_and_hash(payload)?);
        self.phase = HandshakePhase::Complete;
        self.step = 3;
        self.e = None;
        Ok(out)
    }

    fn read_message_3(&mut self, message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let encrypted_static_len = X25519_KEY_SIZE + TAG_SIZE;
        if message.len() < encrypted_static_len + TAG_SIZE {
            return Err(Error::HandshakeFailed("message 3 too short".into()));
        }
        let (encrypted_static, encrypted_payload) = message.split_at(encrypted_static_len);

        let rs_bytes = self.symmetric.decrypt_and_hash(encrypted_static)?;
        let rs = Self::read_public_key(&rs_bytes)?;
        self.rs = Some(rs);

        let se = self.ephemeral()?.diffie_hellman(&rs)?;
        self.symmetric.mix_key(se.as_bytes())?;

        let payload = self.symmetric.decrypt_and_hash(encrypted_payload)?;
        self.phase = HandshakePhase::Complete;
        self.step = 3;
        self.e = None;
        Ok(payload)
    }
}

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeState")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("step", &self.step)
            .field("rs", &self.rs)
            .finish()
    }
}

/// Transport ciphers produced by a completed handshake.
pub struct TransportState {
    /// Encrypts messages to the peer.
    pub sender: SendingCipher,
    /// Decrypts messages from the peer.
    pub receiver: ReceivingCipher,
    /// The authenticated static key of the peer.
    pub remote_static: X25519PublicKey,
    /// Final handshake hash, identical on both sides.
    pub handshake_hash: [u8; HASH_SIZE],
}

impl TransportState {
    /// Encrypt for the peer.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.sender.seal(plaintext)
    }

    /// Decrypt from the peer.
    pub fn open(&mut self, message: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.receiver.open(message)
    }
}

impl fmt::Debug for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportState")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("remote_static", &self.remote_static)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (HandshakeState, HandshakeState, StaticKeypair, StaticKeypair) {
        let alice_static = StaticKeypair::generate();
        let bob_static = StaticKeypair::generate();
        let mut alice = HandshakeState::initiator(alice_static.clone());
        let mut bob = HandshakeState::responder(bob_static.clone());

        let m1 = alice.write_message(b"").expect("write 1");
        assert_eq!(bob.read_message(&m1).expect("read 1"), b"");
        let m2 = bob.write_message(b"from bob").expect("write 2");
        assert_eq!(alice.read_message(&m2).expect("read 2"), b"from bob");
        let m3 = alice.write_message(b"from alice").expect("write 3");
        assert_eq!(bob.read_message(&m3).expect("read 3"), b"from alice");

        (alice, bob, alice_static, bob_static)
    }

    #[test]
    fn test_handshake_completes_symmetrically() {
        let (alice, bob, alice_static, bob_static) = run_handshake();

        assert!(alice.is_complete());
        assert!(bob.is_complete());
        assert_eq!(alice.step(), 3);
        assert_eq!(bob.step(), 3);
        assert_eq!(alice.remote_static(), Some(bob_static.public_key()));
        assert_eq!(bob.remote_static(), Some(alice_static.public_key()));

        let mut alice_t = alice.into_transport().expect("split");
        let mut bob_t = bob.into_transport().expect("split");
        assert_eq!(alice_t.handshake_hash, bob_t.handshake_hash);

        let to_bob = alice_t.seal(b"hello bob").expect("seal");
        assert_eq!(&*bob_t.open(&to_bob).expect("open"), b"hello bob");
        let to_alice = bob_t.seal(b"hello alice").expect("seal");
        assert_eq!(&*alice_t.open(&to_alice).expect("open"), b"hello alice");
    }

    #[test]
    fn test_directions_use_different_keys() {
        let (alice, bob, _, _) = run_handshake();
        let mut alice_t = alice.into_transport().expect("split");
        let mut bob_t = bob.into_transport().expect("split");

        // a message cannot be reflected back to its sender
        let msg = alice_t.seal(b"loop").expect("seal");
        assert!(alice_t.open(&msg).is_err());
        assert!(bob_t.open(&msg).is_ok());
    }

    #[test]
    fn test_phases() {
        let mut alice = HandshakeState::initiator(StaticKeypair::generate());
        let mut bob = HandshakeState::responder(StaticKeypair::generate());
        assert_eq!(alice.phase(), HandshakePhase::Uninitialized);

        let m1 = alice.write_message(b"").expect("write 1");
        assert_eq!(alice.phase(), HandshakePhase::AwaitingMessage2);
        bob.read_message(&m1).expect("read 1");
        assert_eq!(bob.phase(), HandshakePhase::ReadyToRespond);
        let m2 = bob.write_message(b"").expect("write 2");
        assert_eq!(bob.phase(), HandshakePhase::AwaitingMessage3);
        alice.read_message(&m2).expect("read 2");
        assert_eq!(alice.phase(), HandshakePhase::ReadyToFinish);
        assert!(alice.remote_static().is_some());
    }

    #[test]
    fn test_corrupted_static_key_fails_initiator() {
        let mut alice = HandshakeState::initiator(StaticKeypair::generate());
        let mut bob = HandshakeState::responder(StaticKeypair::generate());

        let m1 = alice.write_message(b"").expect("write 1");
        bob.read_message(&m1).expect("read 1");
        let mut m2 = bob.write_message(b"payload").expect("write 2");

        // byte inside the encrypted static key
        m2[X25519_KEY_SIZE + 5] ^= 0x01;

        let err = alice.read_message(&m2).expect_err("must fail");
        assert!(matches!(err, Error::HandshakeFailed(_)));
        assert!(alice.is_failed());
        assert!(alice.remote_static().is_none());

        // terminal
        assert!(alice.write_message(b"").is_err());
        assert!(alice.read_message(&m2).is_err());
        assert!(alice.into_transport().is_err());
    }

    #[test]
    fn test_corrupted_message_3_fails_responder() {
        let mut alice = HandshakeState::initiator(StaticKeypair::generate());
        let mut bob = HandshakeState::responder(StaticKeypair::generate());

        let m1 = alice.write_message(b"").expect("write 1");
        bob.read_message(&m1).expect("read 1");
        let m2 = bob.write_message(b"").expect("write 2");
        alice.read_message(&m2).expect("read 2");
        let mut m3 = alice.write_message(b"").expect("write 3");
        let last = m3.len() - 1;
        m3[last] ^= 0x80;

        assert!(bob.read_message(&m3).is_err());
        assert_eq!(bob.phase(), HandshakePhase::Failed);
    }

    #[test]
    fn test_out_of_order_calls_fail() {
        let mut alice = HandshakeState::initiator(StaticKeypair::generate());
        assert!(alice.read_message(&[0u8; 96]).is_err());
        assert!(alice.is_failed());

        let mut bob = HandshakeState::responder(StaticKeypair::generate());
        assert!(bob.write_message(b"").is_err());
        assert!(bob.is_failed());
    }

    #[test]
    fn test_short_messages_fail() {
        let mut bob = HandshakeState::responder(StaticKeypair::generate());
        assert!(bob.read_message(&[1u8; 10]).is_err());
        assert!(bob.is_failed());

        let mut alice = HandshakeState::initiator(StaticKeypair::generate());
        alice.write_message(b"").expect("write 1");
        assert!(alice.read_message(&[1u8; 40]).is_err());
        assert!(alice.is_failed());
    }

    #[test]
    fn test_low_order_ephemeral_fails() {
        let mut bob = HandshakeState::responder(StaticKeypair::generate());
        bob.read_message(&[0u8; 32]).expect("read 1 does no DH");
        assert!(bob.write_message(b"").is_err());
        assert!(bob.is_failed());
    }

    #[test]
    fn test_split_before_complete_fails() {
        let alice = HandshakeState::initiator(StaticKeypair::generate());
        assert!(alice.into_transport().is_err());
    }
}
