//! Packet types and payload definitions.
//!
//! Application payloads are bincode-encoded. Decoding failures on inbound
//! payloads are reported as malformed packets.

use crate::crypto::X25519PublicKey;
use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Packet types carried in the header's type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Chat message, broadcast or private.
    Message = 0x01,
    /// Private message was received and decrypted.
    DeliveryAck = 0x02,
    /// Private message was read.
    ReadReceipt = 0x03,
    /// Noise message 1.
    HandshakeInit = 0x04,
    /// Noise message 2.
    HandshakeResponse = 0x05,
    /// Noise message 3.
    HandshakeFinal = 0x06,
    /// First fragment of a large packet.
    FragmentStart = 0x07,
    /// Middle fragment.
    FragmentContinue = 0x08,
    /// Last fragment.
    FragmentEnd = 0x09,
    /// Liveness ping.
    Heartbeat = 0x0A,
    /// Signed identity broadcast.
    PeerAnnouncement = 0x0B,
}

impl PacketType {
    /// Parse packet type from byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(Self::Message),
            0x02 => Ok(Self::DeliveryAck),
            0x03 => Ok(Self::ReadReceipt),
            0x04 => Ok(Self::HandshakeInit),
            0x05 => Ok(Self::HandshakeResponse),
            0x06 => Ok(Self::HandshakeFinal),
            0x07 => Ok(Self::FragmentStart),
            0x08 => Ok(Self::FragmentContinue),
            0x09 => Ok(Self::FragmentEnd),
            0x0A => Ok(Self::Heartbeat),
            0x0B => Ok(Self::PeerAnnouncement),
            _ => Err(Error::MalformedPacket(format!(
                "unknown packet type: {:#04x}",
                byte
            ))),
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether this type carries a fragment.
    pub fn is_fragment(self) -> bool {
        matches!(
            self,
            Self::FragmentStart | Self::FragmentContinue | Self::FragmentEnd
        )
    }

    /// Whether this type is a Noise handshake step.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::HandshakeInit | Self::HandshakeResponse | Self::HandshakeFinal
        )
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encoding(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::MalformedPacket(e.to_string()))
}

/// A chat message.
///
/// Carried in cleartext for broadcasts and inside the Noise transport
/// ciphertext for private messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID.
    pub id: Uuid,
    /// Nickname of the author at send time.
    pub sender_nickname: String,
    /// Text content.
    pub content: String,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    /// Set for private messages.
    pub recipient_nickname: Option<String>,
}

impl Message {
    /// Create a message with a fresh random ID.
    pub fn new(sender_nickname: impl Into<String>, content: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_nickname: sender_nickname.into(),
            content: content.into(),
            timestamp,
            recipient_nickname: None,
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_payload(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_payload(bytes)
    }
}

/// Self-signed identity broadcast.
///
/// The enclosing packet is signed with `signing_public_key`, and the
/// sender ID must equal the truncated fingerprint of `static_public_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    /// Display name.
    pub nickname: String,
    /// Noise static key.
    pub static_public_key: X25519PublicKey,
    /// Ed25519 key that signed the packet.
    pub signing_public_key: [u8; 32],
}

impl PeerAnnouncement {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_payload(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_payload(bytes)
    }
}

/// Acknowledges a decrypted private message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// ID of the acknowledged message.
    pub message_id: Uuid,
    /// Nickname of the recipient that decrypted it.
    pub recipient_nickname: String,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

impl DeliveryAck {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_payload(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_payload(bytes)
    }
}

/// Tells the author a private message was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    /// ID of the message that was read.
    pub message_id: Uuid,
    /// Nickname of the reader.
    pub reader_nickname: String,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
}

impl ReadReceipt {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_payload(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_payload(bytes)
    }
}

/// Identity material carried inside handshake messages 2 and 3.
///
/// Encrypted by the handshake, so it is only readable by the other party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeIdentity {
    /// Display name.
    pub nickname: String,
    /// Ed25519 key used for packet signatures.
    pub signing_public_key: [u8; 32],
}

impl HandshakeIdentity {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_payload(self)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_payload(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_bytes() {
        for byte in 1u8..=11 {
            let packet_type = PacketType::from_byte(byte).expect("known type");
            assert_eq!(packet_type.to_byte(), byte);
        }
        assert!(PacketType::from_byte(0).is_err());
        assert!(PacketType::from_byte(12).is_err());
    }

    #[test]
    fn test_type_classes() {
        assert!(PacketType::FragmentContinue.is_fragment());
        assert!(!PacketType::Message.is_fragment());
        assert!(PacketType::HandshakeFinal.is_handshake());
        assert!(!PacketType::Heartbeat.is_handshake());
    }

    #[test]
    fn test_message_payload() {
        let mut message = Message::new("alice", "hello mesh", 42);
        message.recipient_nickname = Some("bob".into());
        let decoded = Message::from_bytes(&message.to_bytes().expect("encode")).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_message_ids_unique() {
        assert_ne!(Message::new("a", "x", 1).id, Message::new("a", "x", 1).id);
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        assert!(matches!(
            PeerAnnouncement::from_bytes(&[0xFF; 3]),
            Err(Error::MalformedPacket(_))
        ));
        assert!(Message::from_bytes(&[]).is_err());
    }
}
