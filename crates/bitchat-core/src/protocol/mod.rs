//! Wire protocol for the BitChat mesh.
//!
//! A strict binary, versioned format. Every packet is padded up to one of a
//! small set of sizes so that packet length leaks as little as possible.
//!
//! ## Packet Structure
//!
//! ```text
//! ┌─────────┬──────┬─────┬───────────┬───────┬─────────────┐
//! │ Version │ Type │ TTL │ Timestamp │ Flags │ Payload Len │
//! │   (1)   │ (1)  │ (1) │  (8, BE)  │  (1)  │   (2, BE)   │
//! └─────────┴──────┴─────┴───────────┴───────┴─────────────┘
//! ┌───────────┬────────────────┬─────────┬────────────────┬─────────┐
//! │ Sender ID │ Recipient ID?  │ Payload │  Signature?    │ Padding │
//! │    (8)    │ (8, flag 0x01) │  (var)  │ (64, flag 0x02)│  (var)  │
//! └───────────┴────────────────┴─────────┴────────────────┴─────────┘
//! ```
//!
//! Padding fills the packet to the smallest of [`PADDING_TIERS`] that fits.
//! Packets larger than the largest tier are split with [`fragment`].

pub mod fragment;
mod packet;
mod types;

pub use fragment::{split_into_fragments, FragmentAssembler, FragmentHeader, FRAGMENT_HEADER_SIZE};
pub use packet::{padded_size, Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use types::{
    DeliveryAck, HandshakeIdentity, Message, PacketType, PeerAnnouncement, ReadReceipt,
};

use crate::error::{Error, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Minimum supported protocol version.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Padded packet sizes, ascending.
pub const PADDING_TIERS: [usize; 4] = [256, 512, 1024, 2048];

/// Largest packet that can be encoded.
pub const MAX_PACKET_SIZE: usize = PADDING_TIERS[PADDING_TIERS.len() - 1];

/// Header flag bits.
pub mod flags {
    /// An 8-byte recipient ID follows the sender ID.
    pub const HAS_RECIPIENT: u8 = 0x01;
    /// A 64-byte signature follows the payload.
    pub const HAS_SIGNATURE: u8 = 0x02;
    /// Payload is compressed. Not supported by this implementation.
    pub const IS_COMPRESSED: u8 = 0x04;
    /// Packet carries a fragment.
    pub const IS_FRAGMENTED: u8 = 0x08;
}

/// Validate that a protocol version is supported.
pub fn validate_version(version: u8) -> Result<()> {
    if !(MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        return Err(Error::MalformedPacket(format!(
            "unsupported protocol version: {}",
            version
        )));
    }
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub fn timestamp_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
