//! Noise protocol for mutual authentication between two peers.
//!
//! Implements `Noise_XX_25519_ChaChaPoly_SHA256` with an empty prologue.
//! The handshake produces a [`TransportState`]: one cipher per direction,
//! each with a strictly increasing 64-bit nonce carried in the message.

mod handshake;
mod state;

pub use handshake::{HandshakePhase, HandshakeState, Role, TransportState};
pub use state::{CipherState, ReceivingCipher, SendingCipher, SymmetricState, TRANSPORT_NONCE_SIZE};

/// Full Noise protocol name. Exactly 32 bytes, so it is used as the initial
/// handshake hash without hashing.
pub const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_SHA256";

/// Bytes a transport message adds to its plaintext.
pub const TRANSPORT_OVERHEAD: usize = TRANSPORT_NONCE_SIZE + crate::crypto::TAG_SIZE;
