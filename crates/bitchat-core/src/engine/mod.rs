//! The protocol engine.
//!
//! [`ProtocolEngine`] owns the peer table, the dedup filter, the handshake
//! and transport sessions, and the registered transports. It turns inbound
//! frames into events and relays, and turns application requests into
//! packets.
//!
//! ## Inbound pipeline
//!
//! ```text
//! decode ─► blocked? ─► own echo? ─► seen? ─► dispatch ─► relay
//!    │          │           │          │
//!    └──────────┴───────────┴──────────┴──► drop
//! ```
//!
//! Dispatch failures (bad signature, failed decryption) are logged and do
//! not stop the relay step: intermediate nodes cannot judge payloads that
//! are not addressed to them.
//!
//! All methods take `&mut self`. Use [`spawn`] to run the engine as a
//! single tokio task driven by an [`EngineHandle`].

mod actor;
mod events;

pub use actor::{spawn, EngineCommand, EngineHandle};
pub use events::EngineEvent;

use crate::bloom::BloomFilter;
use crate::config::EngineConfig;
use crate::crypto::random_bytes;
use crate::error::{Error, Result};
use crate::identity::{Identity, Peer, PeerId, PeerUpdate, TrustLevel, TrustStore};
use crate::logging::{RedactedBytes, ShortHex};
use crate::noise::{HandshakePhase, HandshakeState, Role, TransportState};
use crate::protocol::{
    padded_size, split_into_fragments, timestamp_ms, DeliveryAck, FragmentAssembler,
    HandshakeIdentity, Message, Packet, PacketType, PeerAnnouncement, ReadReceipt,
};
use crate::transport::{InboundFrame, InboundSink, Transport, TransportId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// What happened to an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Could not be decoded.
    Malformed,
    /// Sender is blocked.
    Blocked,
    /// Our own packet came back to us.
    Echo,
    /// Already seen.
    Duplicate,
    /// Processed. `relayed` tells whether a copy was forwarded.
    Accepted {
        /// A copy went out on at least one transport.
        relayed: bool,
    },
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Handshakes aborted for taking too long.
    pub handshakes_timed_out: usize,
    /// Whether the bloom filter was cleared.
    pub bloom_cleared: bool,
    /// Peers newly marked disconnected.
    pub peers_marked_stale: usize,
    /// Incomplete fragmented packets dropped.
    pub fragments_expired: usize,
}

struct PendingHandshake {
    state: HandshakeState,
    started_at: u64,
}

/// Mesh protocol state machine for one node.
pub struct ProtocolEngine {
    identity: Identity,
    config: EngineConfig,
    peers: TrustStore,
    bloom: BloomFilter,
    bloom_reset_at: u64,
    handshakes: HashMap<PeerId, PendingHandshake>,
    sessions: HashMap<PeerId, TransportState>,
    fragments: FragmentAssembler,
    transports: Vec<(TransportId, Arc<dyn Transport>)>,
    next_transport_id: u32,
    last_timestamp: u64,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: Option<mpsc::Receiver<InboundFrame>>,
    events: broadcast::Sender<EngineEvent>,
}

impl ProtocolEngine {
    /// Create an engine for `identity`.
    pub fn new(identity: Identity, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);
        let (events, _) = broadcast::channel(config.event_channel_capacity);

        Ok(Self {
            bloom: BloomFilter::new(config.bloom_expected_items, config.bloom_false_positive_rate),
            bloom_reset_at: timestamp_ms(),
            fragments: FragmentAssembler::new(config.fragment_timeout().as_millis() as u64),
            identity,
            config,
            peers: TrustStore::new(),
            handshakes: HashMap::new(),
            sessions: HashMap::new(),
            transports: Vec::new(),
            next_transport_id: 0,
            last_timestamp: 0,
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            events,
        })
    }

    /// Seed the peer table, e.g. from storage. Existing entries win.
    pub fn load_peers(&mut self, peers: impl IntoIterator<Item = Peer>) {
        for mut peer in peers {
            // nothing is connected at startup
            peer.is_connected = false;
            self.peers.add_peer(peer);
        }
    }

    /// Our identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Our peer ID.
    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event channel, for handles.
    pub(crate) fn event_sender(&self) -> broadcast::Sender<EngineEvent> {
        self.events.clone()
    }

    /// Take the inbound frame queue. Only the driver of the engine calls this.
    pub fn take_inbound_receiver(&mut self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.inbound_rx.take()
    }

    /// Snapshot of all known peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.peers().cloned().collect()
    }

    /// Snapshot of one peer.
    pub fn peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.get_peer(id).cloned()
    }

    /// Whether a Noise session with `peer` is established.
    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Phase of an in-progress handshake with `peer`.
    pub fn handshake_phase(&self, peer: &PeerId) -> Option<HandshakePhase> {
        self.handshakes.get(peer).map(|p| p.state.phase())
    }

    /// Mark a peer verified.
    pub fn verify_peer(&mut self, peer: &PeerId) -> Result<TrustLevel> {
        let level = self.peers.verify_peer(peer)?;
        self.emit_peer_updated(peer);
        Ok(level)
    }

    /// Promote a verified peer to trusted.
    pub fn promote_to_trusted(&mut self, peer: &PeerId) -> Result<TrustLevel> {
        let level = self.peers.promote_to_trusted(peer)?;
        self.emit_peer_updated(peer);
        Ok(level)
    }

    /// Block a peer and tear down any session with it.
    pub fn block_peer(&mut self, peer: &PeerId) -> Result<()> {
        self.peers.block_peer(peer)?;
        self.sessions.remove(peer);
        self.handshakes.remove(peer);
        info!(peer = %peer, "Peer blocked");
        self.emit_peer_updated(peer);
        Ok(())
    }

    /// Unblock a peer.
    pub fn unblock_peer(&mut self, peer: &PeerId) -> Result<()> {
        self.peers.unblock_peer(peer)?;
        self.emit_peer_updated(peer);
        Ok(())
    }

    /// Set or clear the favorite flag.
    pub fn set_favorite(&mut self, peer: &PeerId, favorite: bool) -> Result<()> {
        self.peers.set_favorite(peer, favorite)?;
        self.emit_peer_updated(peer);
        Ok(())
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&mut self, peer: &PeerId) -> Option<Peer> {
        self.sessions.remove(peer);
        self.handshakes.remove(peer);
        self.peers.remove_peer(peer)
    }

    /// Register and initialize a transport.
    pub async fn add_transport(&mut self, transport: Arc<dyn Transport>) -> Result<TransportId> {
        let id = TransportId(self.next_transport_id);
        self.next_transport_id += 1;
        transport
            .initialize(InboundSink::new(id, self.inbound_tx.clone()))
            .await?;
        info!(transport = %id, kind = ?transport.kind(), "Transport registered");
        self.transports.push((id, transport));
        Ok(id)
    }

    /// Shut down every transport. Errors are logged.
    pub async fn shutdown(&mut self) {
        for (id, transport) in self.transports.drain(..) {
            if let Err(e) = transport.shutdown().await {
                warn!(transport = %id, error = %e, "Transport shutdown failed");
            }
        }
        info!(peer_id = %self.identity.peer_id(), "Engine shut down");
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Process one frame from a transport.
    pub async fn handle_inbound(&mut self, frame: InboundFrame) -> Disposition {
        let now = timestamp_ms();
        let packet = match Packet::decode(&frame.bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(
                    transport = %frame.transport,
                    len = frame.bytes.len(),
                    head = %ShortHex(&frame.bytes),
                    error = %e,
                    "Dropping malformed frame"
                );
                return Disposition::Malformed;
            }
        };

        if self.peers.is_blocked(&packet.sender_id) {
            trace!(sender = %packet.sender_id, "Dropping packet from blocked peer");
            return Disposition::Blocked;
        }
        if packet.sender_id == self.identity.peer_id() {
            return Disposition::Echo;
        }

        if self.bloom.len() >= self.config.bloom_reset_after_insertions {
            debug!(insertions = self.bloom.len(), "Bloom filter full, clearing");
            self.reset_bloom(now);
        }
        if self.bloom.check_and_add(&packet.dedup_key()) {
            trace!(sender = %packet.sender_id, timestamp = packet.timestamp, "Duplicate packet");
            return Disposition::Duplicate;
        }

        self.peers.record_seen(&packet.sender_id, now);

        if let Err(e) = self.dispatch(&packet, now).await {
            if e.should_silent_drop() {
                debug!(
                    sender = %packet.sender_id,
                    packet_type = ?packet.packet_type,
                    payload = %RedactedBytes(&packet.payload),
                    error = %e,
                    "Dropped invalid packet"
                );
            } else {
                warn!(
                    sender = %packet.sender_id,
                    packet_type = ?packet.packet_type,
                    error = %e,
                    "Failed to process packet"
                );
            }
        }

        let relayed = self.relay(&packet, frame.transport).await;
        Disposition::Accepted { relayed }
    }

    async fn dispatch(&mut self, packet: &Packet, now: u64) -> Result<()> {
        if !packet.packet_type.is_fragment() {
            return self.dispatch_packet(packet, now).await;
        }

        let me = self.identity.peer_id();
        if !packet.is_broadcast() && !packet.is_addressed_to(&me) {
            return Ok(());
        }
        match self.fragments.insert(packet, now)? {
            Some(original) => self.dispatch_packet(&original, now).await,
            None => Ok(()),
        }
    }

    async fn dispatch_packet(&mut self, packet: &Packet, now: u64) -> Result<()> {
        let me = self.identity.peer_id();
        let for_me = packet.is_addressed_to(&me);

        match packet.packet_type {
            PacketType::Message => self.handle_message(packet).await,
            PacketType::PeerAnnouncement => self.handle_announcement(packet, now),
            PacketType::HandshakeInit | PacketType::HandshakeResponse | PacketType::HandshakeFinal => {
                if for_me {
                    self.handle_handshake(packet, now).await
                } else {
                    Ok(())
                }
            }
            PacketType::DeliveryAck if for_me => {
                self.verify_from_known(packet)?;
                let ack = DeliveryAck::from_bytes(&packet.payload)?;
                debug!(from = %packet.sender_id, message_id = %ack.message_id, "Delivery ack received");
                self.emit(EngineEvent::DeliveryAckReceived {
                    from: packet.sender_id,
                    ack,
                });
                Ok(())
            }
            PacketType::ReadReceipt if for_me => {
                self.verify_from_known(packet)?;
                let receipt = ReadReceipt::from_bytes(&packet.payload)?;
                self.emit(EngineEvent::ReadReceiptReceived {
                    from: packet.sender_id,
                    receipt,
                });
                Ok(())
            }
            PacketType::DeliveryAck | PacketType::ReadReceipt | PacketType::Heartbeat => Ok(()),
            PacketType::FragmentStart | PacketType::FragmentContinue | PacketType::FragmentEnd => {
                Err(Error::MalformedPacket("nested fragment".into()))
            }
        }
    }

    async fn handle_message(&mut self, packet: &Packet) -> Result<()> {
        let me = self.identity.peer_id();
        let sender = packet.sender_id;

        match packet.recipient_id {
            None => {
                if packet.signature.is_some() {
                    match self.peers.get_peer(&sender).and_then(|p| p.signing_public_key) {
                        Some(key) => packet.verify(&key)?,
                        None => trace!(sender = %sender, "Signed broadcast from unannounced peer"),
                    }
                }
                let message = Message::from_bytes(&packet.payload)?;
                debug!(from = %sender, message_id = %message.id, "Public message received");
                self.emit(EngineEvent::MessageReceived {
                    from: sender,
                    message,
                    is_private: false,
                });
                Ok(())
            }
            Some(recipient) if recipient == me => {
                self.verify_from_known(packet)?;
                let session = self
                    .sessions
                    .get_mut(&sender)
                    .ok_or_else(|| Error::NotConnected(sender.to_string()))?;
                let plaintext = session.open(&packet.payload)?;
                let message = Message::from_bytes(&plaintext)?;
                info!(from = %sender, message_id = %message.id, "Private message received");

                let message_id = message.id;
                self.emit(EngineEvent::MessageReceived {
                    from: sender,
                    message,
                    is_private: true,
                });
                self.send_delivery_ack(sender, message_id).await
            }
            Some(_) => Ok(()),
        }
    }

    fn handle_announcement(&mut self, packet: &Packet, now: u64) -> Result<()> {
        let announcement = PeerAnnouncement::from_bytes(&packet.payload)?;
        packet.verify(&announcement.signing_public_key)?;

        let update = self.peers.apply_identity(
            packet.sender_id,
            announcement.static_public_key,
            announcement.signing_public_key,
            &announcement.nickname,
            now,
        )?;
        self.emit_peer_change(&packet.sender_id, update);
        Ok(())
    }

    async fn handle_handshake(&mut self, packet: &Packet, now: u64) -> Result<()> {
        let peer = packet.sender_id;
        let step = match packet.packet_type {
            PacketType::HandshakeInit => self.respond_to_init(peer, &packet.payload, now),
            PacketType::HandshakeResponse => self.finish_as_initiator(peer, &packet.payload, now),
            PacketType::HandshakeFinal => self.finish_as_responder(peer, &packet.payload, now),
            _ => return Ok(()),
        };

        match step {
            Ok(Some((reply_type, reply))) => {
                let packet = self.build_packet(reply_type, Some(peer), reply);
                self.transmit(packet, None).await
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.fail_handshake(peer, &e);
                Ok(())
            }
        }
    }

    fn respond_to_init(
        &mut self,
        peer: PeerId,
        message: &[u8],
        now: u64,
    ) -> Result<Option<(PacketType, Vec<u8>)>> {
        // simultaneous open: the lower peer ID keeps the initiator role
        if let Some(pending) = self.handshakes.get(&peer) {
            if pending.state.role() == Role::Initiator && self.identity.peer_id() < peer {
                debug!(peer = %peer, "Ignoring crossed handshake init");
                return Ok(None);
            }
        }

        let local_identity = self.handshake_identity()?;
        let mut state = HandshakeState::responder(self.identity.static_keypair().clone());
        let reply = match state
            .read_message(message)
            .and_then(|_| state.write_message(&local_identity))
        {
            Ok(reply) => reply,
            // a bad init must not disturb a handshake already under way
            Err(e) if self.handshakes.contains_key(&peer) => {
                debug!(peer = %peer, error = %e, "Dropping invalid handshake init");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.handshakes.insert(peer, PendingHandshake { state, started_at: now });
        debug!(peer = %peer, "Handshake init accepted");
        Ok(Some((PacketType::HandshakeResponse, reply)))
    }

    fn finish_as_initiator(
        &mut self,
        peer: PeerId,
        message: &[u8],
        now: u64,
    ) -> Result<Option<(PacketType, Vec<u8>)>> {
        let local_identity = self.handshake_identity()?;
        let Some(pending) = self.handshakes.get_mut(&peer) else {
            debug!(peer = %peer, "Unsolicited handshake response");
            return Ok(None);
        };
        if pending.state.phase() != HandshakePhase::AwaitingMessage2 {
            debug!(peer = %peer, phase = ?pending.state.phase(), "Unexpected handshake response");
            return Ok(None);
        }

        let payload = pending.state.read_message(message)?;
        let remote = HandshakeIdentity::from_bytes(&payload)
            .map_err(|e| Error::HandshakeFailed(format!("bad identity payload: {}", e)))?;
        let reply = pending.state.write_message(&local_identity)?;

        let Some(pending) = self.handshakes.remove(&peer) else {
            return Ok(None);
        };
        let transport = pending.state.into_transport()?;
        self.complete_session(peer, transport, remote, now)?;
        Ok(Some((PacketType::HandshakeFinal, reply)))
    }

    fn finish_as_responder(
        &mut self,
        peer: PeerId,
        message: &[u8],
        now: u64,
    ) -> Result<Option<(PacketType, Vec<u8>)>> {
        let Some(pending) = self.handshakes.get_mut(&peer) else {
            debug!(peer = %peer, "Unsolicited handshake final");
            return Ok(None);
        };
        if pending.state.phase() != HandshakePhase::AwaitingMessage3 {
            debug!(peer = %peer, phase = ?pending.state.phase(), "Unexpected handshake final");
            return Ok(None);
        }

        let payload = pending.state.read_message(message)?;
        let remote = HandshakeIdentity::from_bytes(&payload)
            .map_err(|e| Error::HandshakeFailed(format!("bad identity payload: {}", e)))?;

        let Some(pending) = self.handshakes.remove(&peer) else {
            return Ok(None);
        };
        let transport = pending.state.into_transport()?;
        self.complete_session(peer, transport, remote, now)?;
        Ok(None)
    }

    fn complete_session(
        &mut self,
        peer: PeerId,
        transport: TransportState,
        remote: HandshakeIdentity,
        now: u64,
    ) -> Result<()> {
        if PeerId::from_static_key(&transport.remote_static) != peer {
            return Err(Error::HandshakeFailed(format!(
                "static key does not match sender id {}",
                peer
            )));
        }

        let update = self
            .peers
            .apply_identity(
                peer,
                transport.remote_static,
                remote.signing_public_key,
                &remote.nickname,
                now,
            )
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;

        self.sessions.insert(peer, transport);
        self.emit_peer_change(&peer, update);

        let fingerprint = self
            .peers
            .get_peer(&peer)
            .map(|p| p.fingerprint)
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?;
        info!(peer = %peer, fingerprint = %fingerprint, "Handshake complete, session established");
        self.emit(EngineEvent::HandshakeCompleted {
            peer_id: peer,
            fingerprint,
        });
        Ok(())
    }

    fn fail_handshake(&mut self, peer: PeerId, error: &Error) {
        self.handshakes.remove(&peer);
        let reason = match error {
            Error::HandshakeFailed(reason) => reason.clone(),
            other => other.to_string(),
        };
        warn!(peer = %peer, reason = %reason, "Handshake failed");
        self.emit(EngineEvent::HandshakeFailed {
            peer_id: peer,
            reason,
        });
    }

    fn handshake_identity(&self) -> Result<Vec<u8>> {
        HandshakeIdentity {
            nickname: self.config.nickname.clone(),
            signing_public_key: self.identity.signing_public_key(),
        }
        .to_bytes()
    }

    /// Require a valid signature from a peer whose signing key we know.
    fn verify_from_known(&self, packet: &Packet) -> Result<()> {
        let key = self
            .peers
            .get_peer(&packet.sender_id)
            .and_then(|p| p.signing_public_key)
            .ok_or_else(|| Error::UnknownPeer(packet.sender_id.to_string()))?;
        packet.verify(&key)
    }

    async fn relay(&self, packet: &Packet, arrival: TransportId) -> bool {
        if packet.is_addressed_to(&self.identity.peer_id()) {
            return false;
        }
        let Some(copy) = packet.relay_copy() else {
            return false;
        };

        let bytes = match copy.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to re-encode packet for relay");
                return false;
            }
        };

        match self.send_bytes(&bytes, copy.recipient_id, Some(arrival)).await {
            Ok(attempted) if attempted > 0 => {
                trace!(sender = %copy.sender_id, ttl = copy.ttl, "Packet relayed");
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "Relay failed on every transport");
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// Broadcast a public chat message.
    pub async fn send_public(&mut self, content: &str) -> Result<Message> {
        let timestamp = self.next_timestamp();
        let message = Message::new(self.config.nickname.clone(), content, timestamp);

        let mut packet = self.build_packet(PacketType::Message, None, message.to_bytes()?);
        if self.config.sign_broadcasts {
            packet.sign(self.identity.signing_keypair())?;
        }
        self.transmit(packet, None).await?;
        debug!(message_id = %message.id, "Public message sent");
        Ok(message)
    }

    /// Send an encrypted message to a peer with an established session.
    pub async fn send_private(&mut self, peer: PeerId, content: &str) -> Result<Message> {
        if self.peers.is_blocked(&peer) {
            return Err(Error::Blocked(peer.to_string()));
        }
        if !self.sessions.contains_key(&peer) {
            return Err(Error::NotConnected(peer.to_string()));
        }

        let timestamp = self.next_timestamp();
        let mut message = Message::new(self.config.nickname.clone(), content, timestamp);
        message.recipient_nickname = self.peers.get_peer(&peer).map(|p| p.nickname.clone());
        let plaintext = message.to_bytes()?;

        let sealed = match self.sessions.get_mut(&peer) {
            Some(session) => session.seal(&plaintext),
            None => return Err(Error::NotConnected(peer.to_string())),
        };
        let ciphertext = match sealed {
            Ok(ciphertext) => ciphertext,
            Err(Error::NonceExhausted) => {
                warn!(peer = %peer, "Session nonces exhausted, dropping session");
                self.sessions.remove(&peer);
                return Err(Error::NonceExhausted);
            }
            Err(e) => return Err(e),
        };

        let mut packet = self.build_packet(PacketType::Message, Some(peer), ciphertext);
        packet.sign(self.identity.signing_keypair())?;
        self.transmit(packet, None).await?;
        info!(to = %peer, message_id = %message.id, "Private message sent");
        Ok(message)
    }

    /// Broadcast our signed identity.
    pub async fn announce(&mut self) -> Result<()> {
        let announcement = PeerAnnouncement {
            nickname: self.config.nickname.clone(),
            static_public_key: *self.identity.static_public_key(),
            signing_public_key: self.identity.signing_public_key(),
        };
        let mut packet = self.build_packet(PacketType::PeerAnnouncement, None, announcement.to_bytes()?);
        packet.sign(self.identity.signing_keypair())?;
        self.transmit(packet, None).await?;
        debug!(nickname = %self.config.nickname, "Announcement sent");
        Ok(())
    }

    /// Start a Noise handshake with `peer`. Replaces any pending attempt.
    pub async fn initiate_handshake(&mut self, peer: PeerId) -> Result<()> {
        if self.peers.is_blocked(&peer) {
            return Err(Error::Blocked(peer.to_string()));
        }
        if peer == self.identity.peer_id() {
            return Err(Error::HandshakeFailed("cannot handshake with ourselves".into()));
        }

        let mut state = HandshakeState::initiator(self.identity.static_keypair().clone());
        let message = state.write_message(&[])?;
        self.handshakes.insert(
            peer,
            PendingHandshake {
                state,
                started_at: timestamp_ms(),
            },
        );

        let packet = self.build_packet(PacketType::HandshakeInit, Some(peer), message);
        self.transmit(packet, None).await?;
        info!(peer = %peer, "Handshake initiated");
        Ok(())
    }

    /// Tell the author of a private message that we read it.
    pub async fn send_read_receipt(&mut self, peer: PeerId, message_id: Uuid) -> Result<()> {
        let receipt = ReadReceipt {
            message_id,
            reader_nickname: self.config.nickname.clone(),
            timestamp: timestamp_ms(),
        };
        let mut packet = self.build_packet(PacketType::ReadReceipt, Some(peer), receipt.to_bytes()?);
        packet.sign(self.identity.signing_keypair())?;
        self.transmit(packet, None).await
    }

    /// Tell direct neighbours we are alive. Never relayed.
    pub async fn send_heartbeat(&mut self) -> Result<()> {
        let mut packet = self.build_packet(PacketType::Heartbeat, None, Vec::new());
        packet.ttl = 1;
        self.transmit(packet, None).await
    }

    async fn send_delivery_ack(&mut self, peer: PeerId, message_id: Uuid) -> Result<()> {
        let ack = DeliveryAck {
            message_id,
            recipient_nickname: self.config.nickname.clone(),
            timestamp: timestamp_ms(),
        };
        let mut packet = self.build_packet(PacketType::DeliveryAck, Some(peer), ack.to_bytes()?);
        packet.sign(self.identity.signing_keypair())?;
        self.transmit(packet, None).await
    }

    /// Strictly increasing per engine so our dedup keys never collide.
    fn next_timestamp(&mut self) -> u64 {
        let timestamp = timestamp_ms().max(self.last_timestamp + 1);
        self.last_timestamp = timestamp;
        timestamp
    }

    fn build_packet(&mut self, packet_type: PacketType, recipient: Option<PeerId>, payload: Vec<u8>) -> Packet {
        let timestamp = self.next_timestamp();
        let mut packet = Packet::new(
            packet_type,
            self.identity.peer_id(),
            self.config.effective_ttl(),
            timestamp,
            payload,
        );
        packet.recipient_id = recipient;
        packet
    }

    /// Encode (fragmenting if needed) and hand to the transports.
    async fn transmit(&mut self, packet: Packet, exclude: Option<TransportId>) -> Result<()> {
        let unpadded = packet.encode_unpadded()?;
        let frames = if padded_size(unpadded.len()).is_some() {
            vec![packet.encode()?]
        } else {
            let fragments = split_into_fragments(&packet, random_bytes(), || self.next_timestamp())?;
            debug!(
                packet_type = ?packet.packet_type,
                size = unpadded.len(),
                fragments = fragments.len(),
                "Fragmenting packet"
            );
            fragments
                .iter()
                .map(Packet::encode)
                .collect::<Result<Vec<_>>>()?
        };

        for frame in &frames {
            self.send_bytes(frame, packet.recipient_id, exclude).await?;
        }
        Ok(())
    }

    /// Send over every transport except `exclude`.
    ///
    /// Returns how many transports were tried. Fails only if every one failed.
    async fn send_bytes(
        &self,
        bytes: &[u8],
        recipient: Option<PeerId>,
        exclude: Option<TransportId>,
    ) -> Result<usize> {
        let mut attempted = 0;
        let mut errors = Vec::new();

        for (id, transport) in &self.transports {
            if Some(*id) == exclude {
                continue;
            }
            attempted += 1;
            let result = match recipient {
                Some(peer) => transport.send_to(bytes, peer).await,
                None => transport.broadcast(bytes).await,
            };
            if let Err(e) = result {
                warn!(transport = %id, error = %e, "Transport send failed");
                errors.push(format!("{}: {}", id, e));
            }
        }

        if attempted > 0 && errors.len() == attempted {
            return Err(Error::Transport(errors.join("; ")));
        }
        Ok(attempted)
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    /// Periodic housekeeping. `now` is milliseconds since the epoch.
    pub fn maintenance(&mut self, now: u64) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        let timeout = self.config.handshake_timeout().as_millis() as u64;
        let expired: Vec<PeerId> = self
            .handshakes
            .iter()
            .filter(|(_, pending)| now.saturating_sub(pending.started_at) > timeout)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            self.handshakes.remove(&peer);
            warn!(peer = %peer, "Handshake timed out");
            self.emit(EngineEvent::HandshakeTimedOut { peer_id: peer });
            report.handshakes_timed_out += 1;
        }

        let interval = self.config.bloom_reset_interval().as_millis() as u64;
        if now.saturating_sub(self.bloom_reset_at) >= interval
            || self.bloom.len() >= self.config.bloom_reset_after_insertions
        {
            debug!(
                insertions = self.bloom.len(),
                estimated_fp = self.bloom.estimated_fp_rate(),
                "Clearing bloom filter"
            );
            self.reset_bloom(now);
            report.bloom_cleared = true;
        }

        let stale_after = self.config.peer_stale_after().as_millis() as u64;
        for peer in self.peers.stale_peers(now, stale_after) {
            self.peers.mark_disconnected(&peer);
            // dropping the session zeroes its keys
            self.sessions.remove(&peer);
            self.handshakes.remove(&peer);
            debug!(peer = %peer, "Peer marked disconnected");
            self.emit_peer_updated(&peer);
            report.peers_marked_stale += 1;
        }

        report.fragments_expired = self.fragments.expire(now);
        report
    }

    fn reset_bloom(&mut self, now: u64) {
        self.bloom.clear();
        self.bloom_reset_at = now;
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_peer_updated(&self, peer: &PeerId) {
        if let Some(record) = self.peers.get_peer(peer) {
            self.emit(EngineEvent::PeerUpdated(record.clone()));
        }
    }

    fn emit_peer_change(&self, peer: &PeerId, update: PeerUpdate) {
        let Some(record) = self.peers.get_peer(peer).cloned() else {
            return;
        };
        match update {
            PeerUpdate::Discovered => {
                info!(peer = %peer, nickname = %record.nickname, "Peer discovered");
                self.emit(EngineEvent::PeerDiscovered(record));
            }
            PeerUpdate::Updated => self.emit(EngineEvent::PeerUpdated(record)),
        }
    }
}
