//! Events published by the engine.

use crate::identity::{Fingerprint, Peer, PeerId};
use crate::protocol::{DeliveryAck, Message, ReadReceipt};

/// Something the application may want to react to.
///
/// Delivered on a `tokio::sync::broadcast` channel; slow subscribers may
/// miss events and see `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A chat message for us, or a public broadcast.
    MessageReceived {
        /// Original sender.
        from: PeerId,
        /// Decoded message.
        message: Message,
        /// Decrypted from a private packet.
        is_private: bool,
    },
    /// A peer was added to the table.
    PeerDiscovered(Peer),
    /// A known peer's record changed.
    PeerUpdated(Peer),
    /// A private message we sent was decrypted by its recipient.
    DeliveryAckReceived {
        /// Who acknowledged.
        from: PeerId,
        /// The acknowledgement.
        ack: DeliveryAck,
    },
    /// A private message we sent was read.
    ReadReceiptReceived {
        /// Who read it.
        from: PeerId,
        /// The receipt.
        receipt: ReadReceipt,
    },
    /// A Noise session was established.
    HandshakeCompleted {
        /// The authenticated peer.
        peer_id: PeerId,
        /// Fingerprint of its static key, for out-of-band comparison.
        fingerprint: Fingerprint,
    },
    /// A handshake was aborted.
    HandshakeFailed {
        /// The other party.
        peer_id: PeerId,
        /// Human-readable cause.
        reason: String,
    },
    /// A handshake did not complete in time.
    HandshakeTimedOut {
        /// The other party.
        peer_id: PeerId,
    },
}
