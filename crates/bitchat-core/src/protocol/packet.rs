//! Packet framing and parsing.
//!
//! Handles the binary packet format with strict validation.
//! Malformed packets are dropped by the caller, never answered.

use super::types::PacketType;
use super::{flags, validate_version, MAX_PACKET_SIZE, PADDING_TIERS, PROTOCOL_VERSION};
use crate::crypto::{verify_signature, SigningKeypair, SIGNATURE_SIZE};
use crate::error::{Error, Result};
use crate::identity::{PeerId, PEER_ID_SIZE};
use crate::MAX_TTL;

/// Fixed header: version, type, ttl, timestamp, flags, payload length.
pub const HEADER_SIZE: usize = 1 + 1 + 1 + 8 + 1 + 2;

/// Largest payload that still fits the largest tier with every optional field present.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE - 2 * PEER_ID_SIZE - SIGNATURE_SIZE;

/// Smallest padding tier that holds `unpadded_len` bytes.
pub fn padded_size(unpadded_len: usize) -> Option<usize> {
    PADDING_TIERS.iter().copied().find(|&tier| tier >= unpadded_len)
}

/// A decoded packet.
///
/// Flags are not stored; they are derived from which optional fields are
/// present and from the packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version.
    pub version: u8,
    /// Packet type.
    pub packet_type: PacketType,
    /// Remaining hops.
    pub ttl: u8,
    /// Milliseconds since the epoch, set by the original sender.
    pub timestamp: u64,
    /// Original sender.
    pub sender_id: PeerId,
    /// Addressee, if this is not a broadcast.
    pub recipient_id: Option<PeerId>,
    /// Type-specific payload.
    pub payload: Vec<u8>,
    /// Ed25519 signature over [`Packet::signing_bytes`].
    pub signature: Option<[u8; SIGNATURE_SIZE]>,
}

impl Packet {
    /// Create an unsigned broadcast packet.
    pub fn new(packet_type: PacketType, sender_id: PeerId, ttl: u8, timestamp: u64, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            ttl,
            timestamp,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Address the packet to one peer.
    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self
    }

    /// Flag byte as it appears on the wire.
    pub fn flags(&self) -> u8 {
        let mut value = 0;
        if self.recipient_id.is_some() {
            value |= flags::HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            value |= flags::HAS_SIGNATURE;
        }
        if self.packet_type.is_fragment() {
            value |= flags::IS_FRAGMENTED;
        }
        value
    }

    /// Whether the packet has no recipient.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Whether the packet is addressed to `peer`.
    pub fn is_addressed_to(&self, peer: &PeerId) -> bool {
        self.recipient_id.as_ref() == Some(peer)
    }

    /// Serialize and pad to the smallest fitting tier.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = self.encode_unpadded()?;
        let tier = padded_size(bytes.len()).ok_or_else(|| {
            Error::Encoding(format!(
                "packet of {} bytes exceeds largest tier {}",
                bytes.len(),
                MAX_PACKET_SIZE
            ))
        })?;

        let pad_len = tier - bytes.len();
        // one byte can only hold the length for pads below 256
        let pad_byte = (pad_len & 0xFF) as u8;
        bytes.resize(tier, pad_byte);
        Ok(bytes)
    }

    /// Serialize without padding.
    pub fn encode_unpadded(&self) -> Result<Vec<u8>> {
        self.write(self.ttl, true)
    }

    /// Canonical bytes covered by the signature.
    ///
    /// TTL is zeroed and the signature removed so that relays decrementing
    /// the TTL do not invalidate it.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        self.write(0, false)
    }

    fn write(&self, ttl: u8, include_signature: bool) -> Result<Vec<u8>> {
        let payload_len = u16::try_from(self.payload.len()).map_err(|_| {
            Error::Encoding(format!("payload of {} bytes too large", self.payload.len()))
        })?;

        let signature = if include_signature { self.signature.as_ref() } else { None };
        let mut flag_byte = self.flags();
        if signature.is_none() {
            flag_byte &= !flags::HAS_SIGNATURE;
        }

        let size = HEADER_SIZE
            + PEER_ID_SIZE
            + self.recipient_id.map_or(0, |_| PEER_ID_SIZE)
            + self.payload.len()
            + signature.map_or(0, |_| SIGNATURE_SIZE);

        let mut bytes = Vec::with_capacity(padded_size(size).unwrap_or(size));
        bytes.push(self.version);
        bytes.push(self.packet_type.to_byte());
        bytes.push(ttl);
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.push(flag_byte);
        bytes.extend_from_slice(&payload_len.to_be_bytes());
        bytes.extend_from_slice(self.sender_id.as_bytes());
        if let Some(recipient) = &self.recipient_id {
            bytes.extend_from_slice(recipient.as_bytes());
        }
        bytes.extend_from_slice(&self.payload);
        if let Some(signature) = signature {
            bytes.extend_from_slice(signature);
        }
        Ok(bytes)
    }

    /// Parse a packet. Trailing bytes past the structural end are padding
    /// and are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MalformedPacket("header too short".into()));
        }

        let version = bytes[0];
        validate_version(version)?;

        let packet_type = PacketType::from_byte(bytes[1])?;
        let ttl = bytes[2];
        let timestamp = u64::from_be_bytes(read_array(bytes, 3)?);
        let flag_byte = bytes[11];
        let payload_len = u16::from_be_bytes(read_array(bytes, 12)?) as usize;

        if flag_byte & flags::IS_COMPRESSED != 0 {
            return Err(Error::MalformedPacket("compressed payloads are not supported".into()));
        }

        let mut offset = HEADER_SIZE;
        let sender_id = PeerId::from_bytes(read_array(bytes, offset)?);
        offset += PEER_ID_SIZE;

        let recipient_id = if flag_byte & flags::HAS_RECIPIENT != 0 {
            let id = PeerId::from_bytes(read_array(bytes, offset)?);
            offset += PEER_ID_SIZE;
            Some(id)
        } else {
            None
        };

        let payload = bytes
            .get(offset..offset + payload_len)
            .ok_or_else(|| Error::MalformedPacket("payload length exceeds buffer".into()))?
            .to_vec();
        offset += payload_len;

        let signature = if flag_byte & flags::HAS_SIGNATURE != 0 {
            Some(read_array::<SIGNATURE_SIZE>(bytes, offset)?)
        } else {
            None
        };

        Ok(Self {
            version,
            packet_type,
            ttl,
            timestamp,
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }

    /// Sign with our key, replacing any previous signature.
    pub fn sign(&mut self, keypair: &SigningKeypair) -> Result<()> {
        let message = self.signing_bytes()?;
        self.signature = Some(keypair.sign(&message));
        Ok(())
    }

    /// Verify the signature against a known Ed25519 key.
    pub fn verify(&self, signing_public_key: &[u8; 32]) -> Result<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| Error::Crypto("packet is not signed".into()))?;
        verify_signature(signing_public_key, &self.signing_bytes()?, signature)
    }

    /// Key used for duplicate suppression: `sender_id || timestamp`.
    pub fn dedup_key(&self) -> [u8; PEER_ID_SIZE + 8] {
        let mut key = [0u8; PEER_ID_SIZE + 8];
        key[..PEER_ID_SIZE].copy_from_slice(self.sender_id.as_bytes());
        key[PEER_ID_SIZE..].copy_from_slice(&self.timestamp.to_be_bytes());
        key
    }

    /// Copy to forward one more hop, or `None` if the hop budget is spent.
    ///
    /// TTL above [`MAX_TTL`] is clamped first.
    pub fn relay_copy(&self) -> Option<Self> {
        let next_ttl = self.ttl.min(MAX_TTL).checked_sub(1)?;
        if next_ttl == 0 {
            return None;
        }
        let mut copy = self.clone();
        copy.ttl = next_ttl;
        Some(copy)
    }
}

fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| Error::MalformedPacket(format!("truncated field at offset {}", offset)))
}
