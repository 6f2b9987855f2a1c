//! Transport abstraction.
//!
//! A transport moves opaque, already padded packet bytes between this node
//! and whatever it is linked to. It knows nothing about packets, sessions or
//! peers beyond an optional unicast hint. Each registered transport gets a
//! [`TransportId`] so the engine can avoid relaying a packet back over the
//! link it arrived on.

mod loopback;

pub use loopback::LoopbackTransport;

use crate::error::{Error, Result};
use crate::identity::PeerId;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Identifies one registered transport within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u32);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// The medium behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// In-process link, for tests and simulation.
    Loopback,
    /// Bluetooth Low Energy mesh.
    BluetoothLe,
    /// Internet relay.
    Relay,
}

/// Bytes received by a transport.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Which transport delivered the bytes.
    pub transport: TransportId,
    /// Raw packet bytes, still padded.
    pub bytes: Vec<u8>,
}

/// Handle a transport uses to hand received bytes to the engine.
#[derive(Debug, Clone)]
pub struct InboundSink {
    transport: TransportId,
    tx: mpsc::Sender<InboundFrame>,
}

impl InboundSink {
    /// Create a sink stamping frames with `transport`.
    pub fn new(transport: TransportId, tx: mpsc::Sender<InboundFrame>) -> Self {
        Self { transport, tx }
    }

    /// The transport this sink belongs to.
    pub fn transport(&self) -> TransportId {
        self.transport
    }

    /// Deliver received bytes, waiting for queue space.
    pub async fn deliver(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(InboundFrame {
                transport: self.transport,
                bytes,
            })
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

/// A link to other nodes.
///
/// Implementations must be cheap to call concurrently; the engine awaits
/// each send in turn.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The medium.
    fn kind(&self) -> TransportKind;

    /// Start receiving. Every frame received afterwards goes to `sink`.
    async fn initialize(&self, sink: InboundSink) -> Result<()>;

    /// Stop receiving and release resources.
    async fn shutdown(&self) -> Result<()>;

    /// Send to one peer. Transports without addressing may flood instead.
    async fn send_to(&self, bytes: &[u8], recipient: PeerId) -> Result<()>;

    /// Send to every directly reachable node.
    async fn broadcast(&self, bytes: &[u8]) -> Result<()>;
}
