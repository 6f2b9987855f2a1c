//! Multi-node mesh tests over in-memory links.
//!
//! Every node runs as a spawned engine task; nodes are wired together with
//! loopback pairs, so packets really flow through the relay path.

use std::sync::Arc;
use std::time::Duration;

use bitchat_core::engine::{spawn, EngineEvent, EngineHandle};
use bitchat_core::identity::{Identity, TrustLevel};
use bitchat_core::protocol::{Packet, PacketType};
use bitchat_core::storage::Database;
use bitchat_core::transport::{InboundFrame, InboundSink, LoopbackTransport, Transport, TransportId};
use bitchat_core::{EngineConfig, ProtocolEngine};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

struct Node {
    handle: EngineHandle,
    events: broadcast::Receiver<EngineEvent>,
    task: JoinHandle<()>,
}

impl Node {
    fn start(nickname: &str, max_ttl: u8) -> Self {
        let config = EngineConfig {
            max_ttl,
            ..EngineConfig::with_nickname(nickname)
        };
        let engine = ProtocolEngine::new(Identity::generate(), config).expect("engine");
        let (handle, task) = spawn(engine).expect("spawn");
        let events = handle.subscribe();
        Self { handle, events, task }
    }

    async fn expect(&mut self, mut pred: impl FnMut(&EngineEvent) -> bool) -> EngineEvent {
        let events = &mut self.events;
        timeout(EVENT_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await
        .expect("expected event did not arrive")
    }

    async fn assert_quiet(&mut self, mut pred: impl FnMut(&EngineEvent) -> bool) {
        let events = &mut self.events;
        let seen = timeout(QUIET_PERIOD, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await;
        if let Ok(event) = seen {
            panic!("unexpected event: {:?}", event);
        }
    }

    async fn stop(self) {
        self.handle.shutdown().await.expect("shutdown");
        self.task.await.expect("engine task");
    }
}

async fn link(left: &Node, right: &Node) {
    let (l, r) = LoopbackTransport::pair();
    left.handle.add_transport(Arc::new(l)).await.expect("link left");
    right.handle.add_transport(Arc::new(r)).await.expect("link right");
}

/// Attach a loopback end to `node` whose other end feeds a plain channel.
async fn tap(node: &Node) -> (LoopbackTransport, mpsc::Receiver<InboundFrame>) {
    let (inner, outer) = LoopbackTransport::named_pair("node", "tap");
    node.handle.add_transport(Arc::new(inner)).await.expect("tap");
    let (tx, rx) = mpsc::channel(256);
    outer
        .initialize(InboundSink::new(TransportId(1000), tx))
        .await
        .expect("tap init");
    (outer, rx)
}

fn is_message(event: &EngineEvent) -> bool {
    matches!(event, EngineEvent::MessageReceived { .. })
}

/// A and B only share a relay C; they discover each other, handshake and
/// exchange a private message through it.
#[tokio::test]
async fn test_private_message_through_relay() {
    let mut a = Node::start("alice", 16);
    let c = Node::start("carol", 16);
    let mut b = Node::start("bob", 16);
    link(&a, &c).await;
    link(&c, &b).await;
    let (_tap, mut a_wire) = tap(&a).await;
    let (b_inject, _b_inject_rx) = {
        // test-side end used to replay frames into B
        let (inner, outer) = LoopbackTransport::named_pair("bob", "replay");
        b.handle.add_transport(Arc::new(inner)).await.expect("replay link");
        let (tx, rx) = mpsc::channel(256);
        outer
            .initialize(InboundSink::new(TransportId(1001), tx))
            .await
            .expect("replay init");
        (outer, rx)
    };

    let a_id = a.handle.peer_id();
    let b_id = b.handle.peer_id();

    a.handle.announce().await.expect("announce");
    b.handle.announce().await.expect("announce");
    b.expect(|e| matches!(e, EngineEvent::PeerDiscovered(p) if p.id == a_id)).await;
    a.expect(|e| matches!(e, EngineEvent::PeerDiscovered(p) if p.id == b_id)).await;

    a.handle.initiate_handshake(b_id).await.expect("handshake");
    a.expect(|e| matches!(e, EngineEvent::HandshakeCompleted { peer_id, .. } if *peer_id == b_id))
        .await;
    b.expect(|e| matches!(e, EngineEvent::HandshakeCompleted { peer_id, .. } if *peer_id == a_id))
        .await;

    let sent = a.handle.send_private(b_id, "hello").await.expect("send");
    match b.expect(is_message).await {
        EngineEvent::MessageReceived {
            from,
            message,
            is_private,
        } => {
            assert_eq!(from, a_id);
            assert_eq!(message.content, "hello");
            assert_eq!(message.id, sent.id);
            assert!(is_private);
        }
        other => panic!("unexpected event {:?}", other),
    }
    a.expect(|e| {
        matches!(e, EngineEvent::DeliveryAckReceived { from, ack } if *from == b_id && ack.message_id == sent.id)
    })
    .await;

    // exactly once, even though B sits behind a relay
    b.assert_quiet(is_message).await;

    // the relay never learns the plaintext
    let c_peers = c.handle.peers().await.expect("peers");
    assert_eq!(c_peers.len(), 2);
    assert!(!c.handle.has_session(a_id).await.expect("query"));

    // replaying the captured ciphertext into B changes nothing
    let mut private_frame = None;
    while let Ok(frame) = a_wire.try_recv() {
        let packet = Packet::decode(&frame.bytes).expect("decode tap frame");
        if packet.packet_type == PacketType::Message && packet.recipient_id == Some(b_id) {
            private_frame = Some(frame.bytes);
        }
    }
    let private_frame = private_frame.expect("private message on the wire");
    b_inject.broadcast(&private_frame).await.expect("replay");
    b_inject.broadcast(&private_frame).await.expect("replay");
    b.assert_quiet(is_message).await;

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

/// A packet sent with TTL 2 reaches two hops and no further.
#[tokio::test]
async fn test_ttl_limits_reach() {
    let a = Node::start("alice", 2);
    let mut b = Node::start("bob", 16);
    let mut c = Node::start("carol", 16);
    let mut d = Node::start("dave", 16);
    link(&a, &b).await;
    link(&b, &c).await;
    link(&c, &d).await;

    a.handle.send_public("short range").await.expect("send");

    b.expect(is_message).await;
    c.expect(is_message).await;
    d.assert_quiet(is_message).await;

    for node in [a, b, c, d] {
        node.stop().await;
    }
}

/// A flood in a triangle is delivered once per node.
#[tokio::test]
async fn test_flood_in_cycle_delivered_once() {
    let a = Node::start("alice", 7);
    let mut b = Node::start("bob", 7);
    let mut c = Node::start("carol", 7);
    link(&a, &b).await;
    link(&b, &c).await;
    link(&c, &a).await;

    let sent = a.handle.send_public("round and round").await.expect("send");

    for node in [&mut b, &mut c] {
        match node.expect(is_message).await {
            EngineEvent::MessageReceived { message, .. } => assert_eq!(message.id, sent.id),
            other => panic!("unexpected event {:?}", other),
        }
        node.assert_quiet(is_message).await;
    }

    for node in [a, b, c] {
        node.stop().await;
    }
}

/// Packet processing never changes a trust decision.
#[tokio::test]
async fn test_trust_survives_traffic() {
    let a = Node::start("alice", 7);
    let mut b = Node::start("bob", 7);
    link(&a, &b).await;
    let a_id = a.handle.peer_id();

    a.handle.announce().await.expect("announce");
    b.expect(|e| matches!(e, EngineEvent::PeerDiscovered(_))).await;

    assert_eq!(b.handle.verify_peer(a_id).await.expect("verify"), TrustLevel::Verified);
    assert_eq!(
        b.handle.promote_to_trusted(a_id).await.expect("promote"),
        TrustLevel::Trusted
    );

    a.handle.announce().await.expect("announce");
    a.handle.initiate_handshake(b.handle.peer_id()).await.expect("handshake");
    b.expect(|e| matches!(e, EngineEvent::HandshakeCompleted { .. })).await;
    a.handle.send_public("still me").await.expect("send");
    b.expect(is_message).await;

    let peers = b.handle.peers().await.expect("peers");
    let alice = peers.iter().find(|p| p.id == a_id).expect("alice");
    assert_eq!(alice.trust_level, TrustLevel::Trusted);
    assert_eq!(alice.nickname, "alice");

    a.stop().await;
    b.stop().await;
}

/// Peers learned on the mesh survive a restart through the database.
#[tokio::test]
async fn test_peers_persist_across_restart() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let config = bitchat_core::storage::DatabaseConfig {
        path: dir.path().join("bob.db").to_string_lossy().into_owned(),
        in_memory: false,
    };

    let a = Node::start("alice", 7);
    let mut b = Node::start("bob", 7);
    link(&a, &b).await;
    let a_id = a.handle.peer_id();

    a.handle.announce().await.expect("announce");
    b.expect(|e| matches!(e, EngineEvent::PeerDiscovered(_))).await;
    b.handle.verify_peer(a_id).await.expect("verify");

    {
        let mut db = Database::open(&config).expect("open");
        let peers = b.handle.peers().await.expect("peers");
        assert_eq!(db.save_peers(&peers).expect("save"), 1);
    }

    let db = Database::open(&config).expect("reopen");
    let mut engine = ProtocolEngine::new(Identity::generate(), EngineConfig::default()).expect("engine");
    engine.load_peers(db.load_peers().expect("load"));

    let restored = engine.peer(&a_id).expect("restored");
    assert_eq!(restored.trust_level, TrustLevel::Verified);
    assert!(!restored.is_connected);

    a.stop().await;
    b.stop().await;
}
