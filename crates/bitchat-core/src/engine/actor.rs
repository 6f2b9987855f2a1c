//! Runs a [`ProtocolEngine`] as a single task.
//!
//! The task owns the engine and multiplexes three sources: frames from
//! transports, commands from [`EngineHandle`]s, and the maintenance tick.
//! Everything touching engine state happens on this one task, so there is
//! no locking.

use super::{EngineEvent, ProtocolEngine};
use crate::error::{Error, Result};
use crate::identity::{Peer, PeerId, TrustLevel};
use crate::protocol::{timestamp_ms, Message};
use crate::transport::{Transport, TransportId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMMAND_QUEUE_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests accepted by the engine task.
pub enum EngineCommand {
    /// Broadcast a public message.
    SendPublic {
        /// Message text.
        content: String,
        /// Receives the sent message.
        reply: Reply<Message>,
    },
    /// Send an encrypted message over an established session.
    SendPrivate {
        /// Recipient.
        peer: PeerId,
        /// Message text.
        content: String,
        /// Receives the sent message.
        reply: Reply<Message>,
    },
    /// Start a Noise handshake.
    InitiateHandshake {
        /// Remote peer.
        peer: PeerId,
        /// Completion of the first step only.
        reply: Reply<()>,
    },
    /// Broadcast our identity.
    Announce {
        /// Send result.
        reply: Reply<()>,
    },
    /// Acknowledge reading a message.
    SendReadReceipt {
        /// Author of the message.
        peer: PeerId,
        /// The message that was read.
        message_id: Uuid,
        /// Send result.
        reply: Reply<()>,
    },
    /// One-hop liveness ping.
    SendHeartbeat {
        /// Send result.
        reply: Reply<()>,
    },
    /// Register a transport.
    AddTransport {
        /// The transport; initialized by the engine.
        transport: Arc<dyn Transport>,
        /// Assigned ID.
        reply: Reply<TransportId>,
    },
    /// Snapshot of the peer table.
    Peers {
        /// Receives the snapshot.
        reply: oneshot::Sender<Vec<Peer>>,
    },
    /// Mark a peer verified.
    VerifyPeer {
        /// The peer.
        peer: PeerId,
        /// Resulting trust level.
        reply: Reply<TrustLevel>,
    },
    /// Promote a verified peer to trusted.
    PromotePeer {
        /// The peer.
        peer: PeerId,
        /// Resulting trust level.
        reply: Reply<TrustLevel>,
    },
    /// Block a peer.
    BlockPeer {
        /// The peer.
        peer: PeerId,
        /// Result.
        reply: Reply<()>,
    },
    /// Unblock a peer.
    UnblockPeer {
        /// The peer.
        peer: PeerId,
        /// Result.
        reply: Reply<()>,
    },
    /// Whether a session with a peer exists.
    HasSession {
        /// The peer.
        peer: PeerId,
        /// Answer.
        reply: oneshot::Sender<bool>,
    },
    /// Shut down transports and stop the task.
    Shutdown,
}

// oneshot::Sender and dyn Transport have no Debug
impl fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SendPublic { .. } => f.write_str("SendPublic"),
            Self::SendPrivate { peer, .. } => f.debug_struct("SendPrivate").field("peer", peer).finish_non_exhaustive(),
            Self::InitiateHandshake { peer, .. } => {
                f.debug_struct("InitiateHandshake").field("peer", peer).finish_non_exhaustive()
            }
            Self::Announce { .. } => f.write_str("Announce"),
            Self::SendReadReceipt { peer, message_id, .. } => f
                .debug_struct("SendReadReceipt")
                .field("peer", peer)
                .field("message_id", message_id)
                .finish_non_exhaustive(),
            Self::SendHeartbeat { .. } => f.write_str("SendHeartbeat"),
            Self::AddTransport { transport, .. } => f
                .debug_struct("AddTransport")
                .field("kind", &transport.kind())
                .finish_non_exhaustive(),
            Self::Peers { .. } => f.write_str("Peers"),
            Self::VerifyPeer { peer, .. } => f.debug_struct("VerifyPeer").field("peer", peer).finish_non_exhaustive(),
            Self::PromotePeer { peer, .. } => f.debug_struct("PromotePeer").field("peer", peer).finish_non_exhaustive(),
            Self::BlockPeer { peer, .. } => f.debug_struct("BlockPeer").field("peer", peer).finish_non_exhaustive(),
            Self::UnblockPeer { peer, .. } => f.debug_struct("UnblockPeer").field("peer", peer).finish_non_exhaustive(),
            Self::HasSession { peer, .. } => f.debug_struct("HasSession").field("peer", peer).finish_non_exhaustive(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable front end of a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
    peer_id: PeerId,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle").field("peer_id", &self.peer_id).finish()
    }
}

impl EngineHandle {
    /// Our peer ID.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Raw command sender, for callers that batch requests.
    pub fn command_sender(&self) -> mpsc::Sender<EngineCommand> {
        self.commands.clone()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| Error::ChannelClosed)?;
        response.await.map_err(|_| Error::ChannelClosed)
    }

    /// Broadcast a public message.
    pub async fn send_public(&self, content: impl Into<String>) -> Result<Message> {
        let content = content.into();
        self.request(|reply| EngineCommand::SendPublic { content, reply }).await?
    }

    /// Send an encrypted message to `peer`.
    pub async fn send_private(&self, peer: PeerId, content: impl Into<String>) -> Result<Message> {
        let content = content.into();
        self.request(|reply| EngineCommand::SendPrivate { peer, content, reply })
            .await?
    }

    /// Start a handshake. Completion is reported as an event.
    pub async fn initiate_handshake(&self, peer: PeerId) -> Result<()> {
        self.request(|reply| EngineCommand::InitiateHandshake { peer, reply })
            .await?
    }

    /// Broadcast our identity.
    pub async fn announce(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Announce { reply }).await?
    }

    /// Tell `peer` we read `message_id`.
    pub async fn send_read_receipt(&self, peer: PeerId, message_id: Uuid) -> Result<()> {
        self.request(|reply| EngineCommand::SendReadReceipt {
            peer,
            message_id,
            reply,
        })
        .await?
    }

    /// Send a one-hop heartbeat.
    pub async fn send_heartbeat(&self) -> Result<()> {
        self.request(|reply| EngineCommand::SendHeartbeat { reply }).await?
    }

    /// Register a transport with the running engine.
    pub async fn add_transport(&self, transport: Arc<dyn Transport>) -> Result<TransportId> {
        self.request(|reply| EngineCommand::AddTransport { transport, reply })
            .await?
    }

    /// Snapshot of the peer table.
    pub async fn peers(&self) -> Result<Vec<Peer>> {
        self.request(|reply| EngineCommand::Peers { reply }).await
    }

    /// Mark a peer verified.
    pub async fn verify_peer(&self, peer: PeerId) -> Result<TrustLevel> {
        self.request(|reply| EngineCommand::VerifyPeer { peer, reply }).await?
    }

    /// Promote a verified peer to trusted.
    pub async fn promote_to_trusted(&self, peer: PeerId) -> Result<TrustLevel> {
        self.request(|reply| EngineCommand::PromotePeer { peer, reply }).await?
    }

    /// Block a peer.
    pub async fn block_peer(&self, peer: PeerId) -> Result<()> {
        self.request(|reply| EngineCommand::BlockPeer { peer, reply }).await?
    }

    /// Unblock a peer.
    pub async fn unblock_peer(&self, peer: PeerId) -> Result<()> {
        self.request(|reply| EngineCommand::UnblockPeer { peer, reply }).await?
    }

    /// Whether a session with `peer` is established.
    pub async fn has_session(&self, peer: PeerId) -> Result<bool> {
        self.request(|reply| EngineCommand::HasSession { peer, reply }).await
    }

    /// Ask the engine to stop. Await the task's `JoinHandle` to see it finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

/// Move `engine` onto its own task.
///
/// The task stops on [`EngineHandle::shutdown`] or once every handle is
/// dropped.
pub fn spawn(mut engine: ProtocolEngine) -> Result<(EngineHandle, JoinHandle<()>)> {
    let mut inbound = engine
        .take_inbound_receiver()
        .ok_or_else(|| Error::Config("engine inbound queue already taken".into()))?;
    let (commands, mut command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

    let handle = EngineHandle {
        commands,
        events: engine.event_sender(),
        peer_id: engine.peer_id(),
    };

    let task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(engine.config().maintenance_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(peer_id = %engine.peer_id(), "Engine started");

        loop {
            tokio::select! {
                Some(frame) = inbound.recv() => {
                    engine.handle_inbound(frame).await;
                }
                command = command_rx.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown) | None => break,
                        Some(command) => execute(&mut engine, command).await,
                    }
                }
                _ = tick.tick() => {
                    let report = engine.maintenance(timestamp_ms());
                    if report != Default::default() {
                        debug!(?report, "Maintenance pass");
                    }
                }
            }
        }

        engine.shutdown().await;
    });

    Ok((handle, task))
}

async fn execute(engine: &mut ProtocolEngine, command: EngineCommand) {
    // a dropped reply receiver just means the caller stopped waiting
    let delivered = match command {
        EngineCommand::SendPublic { content, reply } => reply.send(engine.send_public(&content).await).is_ok(),
        EngineCommand::SendPrivate { peer, content, reply } => {
            reply.send(engine.send_private(peer, &content).await).is_ok()
        }
        EngineCommand::InitiateHandshake { peer, reply } => {
            reply.send(engine.initiate_handshake(peer).await).is_ok()
        }
        EngineCommand::Announce { reply } => reply.send(engine.announce().await).is_ok(),
        EngineCommand::SendReadReceipt {
            peer,
            message_id,
            reply,
        } => reply.send(engine.send_read_receipt(peer, message_id).await).is_ok(),
        EngineCommand::SendHeartbeat { reply } => reply.send(engine.send_heartbeat().await).is_ok(),
        EngineCommand::AddTransport { transport, reply } => {
            reply.send(engine.add_transport(transport).await).is_ok()
        }
        EngineCommand::Peers { reply } => reply.send(engine.peers()).is_ok(),
        EngineCommand::VerifyPeer { peer, reply } => reply.send(engine.verify_peer(&peer)).is_ok(),
        EngineCommand::PromotePeer { peer, reply } => reply.send(engine.promote_to_trusted(&peer)).is_ok(),
        EngineCommand::BlockPeer { peer, reply } => reply.send(engine.block_peer(&peer)).is_ok(),
        EngineCommand::UnblockPeer { peer, reply } => reply.send(engine.unblock_peer(&peer)).is_ok(),
        EngineCommand::HasSession { peer, reply } => reply.send(engine.has_session(&peer)).is_ok(),
        EngineCommand::Shutdown => true,
    };

    if !delivered {
        warn!("Engine command caller went away before the reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::identity::Identity;
    use crate::transport::LoopbackTransport;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_matching(
        events: &mut broadcast::Receiver<EngineEvent>,
        mut pred: impl FnMut(&EngineEvent) -> bool,
    ) -> EngineEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await
        .expect("event in time")
    }

    fn engine(nickname: &str) -> ProtocolEngine {
        ProtocolEngine::new(Identity::generate(), EngineConfig::with_nickname(nickname)).expect("engine")
    }

    #[tokio::test]
    async fn test_handles_over_loopback() {
        let (left, right) = LoopbackTransport::named_pair("alice", "bob");
        let (alice, alice_task) = spawn(engine("alice")).expect("spawn");
        let (bob, bob_task) = spawn(engine("bob")).expect("spawn");
        alice.add_transport(Arc::new(left)).await.expect("add");
        bob.add_transport(Arc::new(right)).await.expect("add");

        let mut bob_events = bob.subscribe();
        let mut alice_events = alice.subscribe();

        alice.announce().await.expect("announce");
        next_matching(&mut bob_events, |e| matches!(e, EngineEvent::PeerDiscovered(_))).await;
        assert_eq!(bob.peers().await.expect("peers").len(), 1);

        alice.initiate_handshake(bob.peer_id()).await.expect("handshake");
        next_matching(&mut alice_events, |e| matches!(e, EngineEvent::HandshakeCompleted { .. })).await;
        next_matching(&mut bob_events, |e| matches!(e, EngineEvent::HandshakeCompleted { .. })).await;
        assert!(alice.has_session(bob.peer_id()).await.expect("query"));

        let sent = alice.send_private(bob.peer_id(), "over the wire").await.expect("send");
        let received = next_matching(&mut bob_events, |e| matches!(e, EngineEvent::MessageReceived { .. })).await;
        match received {
            EngineEvent::MessageReceived { message, is_private, .. } => {
                assert!(is_private);
                assert_eq!(message.id, sent.id);
            }
            other => panic!("unexpected event {:?}", other),
        }
        next_matching(&mut alice_events, |e| matches!(e, EngineEvent::DeliveryAckReceived { .. })).await;

        alice.shutdown().await.expect("shutdown");
        bob.shutdown().await.expect("shutdown");
        alice_task.await.expect("join");
        bob_task.await.expect("join");
    }

    #[tokio::test]
    async fn test_closed_engine_reports_channel_closed() {
        let (handle, task) = spawn(engine("solo")).expect("spawn");
        handle.shutdown().await.expect("shutdown");
        task.await.expect("join");

        assert!(matches!(handle.announce().await, Err(Error::ChannelClosed)));
        assert!(matches!(handle.peers().await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_spawn_twice_fails() {
        let mut engine = engine("solo");
        let _rx = engine.take_inbound_receiver();
        assert!(spawn(engine).is_err());
    }

    #[tokio::test]
    async fn test_trust_commands() {
        let (handle, _task) = spawn(engine("solo")).expect("spawn");
        let stranger = Identity::generate().peer_id();
        assert!(matches!(
            handle.verify_peer(stranger).await,
            Err(Error::UnknownPeer(_))
        ));
        assert!(matches!(
            handle.send_private(stranger, "hi").await,
            Err(Error::NotConnected(_))
        ));
        handle.send_heartbeat().await.expect("heartbeat");
    }
}
