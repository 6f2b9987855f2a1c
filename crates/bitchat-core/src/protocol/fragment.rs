//! Fragmentation of packets that exceed the largest padding tier.
//!
//! The unpadded encoding of the original packet is cut into chunks, each
//! carried by a `FragmentStart`/`FragmentContinue`/`FragmentEnd` packet whose
//! payload is:
//!
//! ```text
//! fragment_id (8) | index (2, BE) | total (2, BE) | original_type (1) | data
//! ```
//!
//! Fragments are ordinary packets: they are deduplicated and relayed like
//! any other. Only the reassembled packet is dispatched locally.

use super::packet::{Packet, MAX_PAYLOAD_SIZE};
use super::types::PacketType;
use crate::error::{Error, Result};
use crate::identity::PeerId;
use std::collections::HashMap;
use tracing::debug;

/// Bytes of fragment header inside the fragment packet's payload.
pub const FRAGMENT_HEADER_SIZE: usize = 8 + 2 + 2 + 1;

/// Largest chunk of original bytes one fragment can carry.
pub const MAX_FRAGMENT_DATA: usize = MAX_PAYLOAD_SIZE - FRAGMENT_HEADER_SIZE;

/// Upper bound on concurrently reassembling packets.
const MAX_PENDING: usize = 64;

/// Fragment metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Shared by every fragment of one original packet.
    pub fragment_id: [u8; 8],
    /// Zero-based position.
    pub index: u16,
    /// Number of fragments.
    pub total: u16,
    /// Type of the packet being carried.
    pub original_type: PacketType,
}

impl FragmentHeader {
    /// Prefix `data` with this header.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_SIZE + data.len());
        out.extend_from_slice(&self.fragment_id);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.push(self.original_type.to_byte());
        out.extend_from_slice(data);
        out
    }

    /// Split a fragment payload into header and data.
    pub fn decode(payload: &[u8]) -> Result<(Self, &[u8])> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(Error::MalformedPacket("fragment header too short".into()));
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&payload[..8]);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let total = u16::from_be_bytes([payload[10], payload[11]]);
        let original_type = PacketType::from_byte(payload[12])?;

        if total == 0 || index >= total {
            return Err(Error::MalformedPacket(format!(
                "fragment index {} out of range for total {}",
                index, total
            )));
        }

        Ok((
            Self {
                fragment_id,
                index,
                total,
                original_type,
            },
            &payload[FRAGMENT_HEADER_SIZE..],
        ))
    }
}

/// Cut `original` into fragment packets.
///
/// Each fragment inherits sender, recipient and TTL. `next_timestamp` is
/// called once per fragment so every fragment gets its own dedup key.
pub fn split_into_fragments(
    original: &Packet,
    fragment_id: [u8; 8],
    mut next_timestamp: impl FnMut() -> u64,
) -> Result<Vec<Packet>> {
    let bytes = original.encode_unpadded()?;
    let chunks: Vec<&[u8]> = bytes.chunks(MAX_FRAGMENT_DATA).collect();
    let total = u16::try_from(chunks.len())
        .map_err(|_| Error::Encoding("too many fragments".into()))?;

    let fragments = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let index = i as u16;
            let packet_type = if index == 0 {
                PacketType::FragmentStart
            } else if index + 1 == total {
                PacketType::FragmentEnd
            } else {
                PacketType::FragmentContinue
            };
            let header = FragmentHeader {
                fragment_id,
                index,
                total,
                original_type: original.packet_type,
            };
            let mut fragment = Packet::new(
                packet_type,
                original.sender_id,
                original.ttl,
                next_timestamp(),
                header.encode(chunk),
            );
            fragment.recipient_id = original.recipient_id;
            fragment
        })
        .collect();

    Ok(fragments)
}

struct PartialPacket {
    original_type: PacketType,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    started_at: u64,
}

/// Collects fragments until an original packet is complete.
pub struct FragmentAssembler {
    pending: HashMap<(PeerId, [u8; 8]), PartialPacket>,
    timeout_ms: u64,
}

impl FragmentAssembler {
    /// Create an assembler that forgets incomplete packets after `timeout_ms`.
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            pending: HashMap::new(),
            timeout_ms,
        }
    }

    /// Number of packets being reassembled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one fragment packet. Returns the original once every piece arrived.
    pub fn insert(&mut self, fragment: &Packet, now_ms: u64) -> Result<Option<Packet>> {
        if !fragment.packet_type.is_fragment() {
            return Err(Error::MalformedPacket("not a fragment".into()));
        }
        let (header, data) = FragmentHeader::decode(&fragment.payload)?;
        let key = (fragment.sender_id, header.fragment_id);

        if !self.pending.contains_key(&key) && self.pending.len() >= MAX_PENDING {
            self.evict_oldest();
        }

        let partial = self.pending.entry(key).or_insert_with(|| PartialPacket {
            original_type: header.original_type,
            chunks: vec![None; header.total as usize],
            received: 0,
            started_at: now_ms,
        });

        if partial.chunks.len() != header.total as usize || partial.original_type != header.original_type {
            self.pending.remove(&key);
            return Err(Error::MalformedPacket("inconsistent fragment header".into()));
        }

        let slot = &mut partial.chunks[header.index as usize];
        if slot.is_none() {
            *slot = Some(data.to_vec());
            partial.received += 1;
        }

        if partial.received < partial.chunks.len() {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&key) else {
            return Ok(None);
        };
        let bytes: Vec<u8> = partial.chunks.into_iter().flatten().flatten().collect();
        let original = Packet::decode(&bytes)?;

        if original.packet_type != partial.original_type || original.sender_id != fragment.sender_id {
            return Err(Error::MalformedPacket("reassembled packet does not match fragments".into()));
        }

        debug!(
            sender = %fragment.sender_id,
            fragments = header.total,
            size = bytes.len(),
            "Reassembled fragmented packet"
        );
        Ok(Some(original))
    }

    /// Drop reassemblies older than the timeout. Returns how many were dropped.
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let before = self.pending.len();
        let timeout = self.timeout_ms;
        self.pending
            .retain(|_, partial| now_ms.saturating_sub(partial.started_at) <= timeout);
        before - self.pending.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, partial)| partial.started_at)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            self.pending.remove(&key);
        }
    }
}
