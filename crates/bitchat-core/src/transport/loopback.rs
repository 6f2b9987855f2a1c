//! In-memory point-to-point link.

use super::{InboundSink, Transport, TransportKind};
use crate::error::{Error, Result};
use crate::identity::PeerId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// One end of an in-memory link.
///
/// Whatever one end sends, the other end receives, in order. Bytes sent
/// before the receiving end is initialized are queued.
pub struct LoopbackTransport {
    name: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    frames_sent: AtomicU64,
}

impl LoopbackTransport {
    /// Create both ends of a link.
    pub fn pair() -> (Self, Self) {
        Self::named_pair("a", "b")
    }

    /// Create both ends with names used in log output.
    pub fn named_pair(left: &str, right: &str) -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (
            Self::end(format!("{}->{}", left, right), left_tx, left_rx),
            Self::end(format!("{}->{}", right, left), right_tx, right_rx),
        )
    }

    fn end(
        name: String,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            name,
            outbound,
            inbound: Mutex::new(Some(inbound)),
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Link name, as shown in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of frames this end has sent.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Transport(format!("{} is shut down", self.name)));
        }
        self.outbound
            .send(bytes.to_vec())
            .map_err(|_| Error::Transport(format!("{} peer end closed", self.name)))?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!(link = %self.name, len = bytes.len(), "Loopback frame sent");
        Ok(())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    async fn initialize(&self, sink: InboundSink) -> Result<()> {
        let mut inbound = self
            .inbound
            .lock()
            .map_err(|_| Error::Transport("loopback lock poisoned".into()))?
            .take()
            .ok_or_else(|| Error::Transport(format!("{} already initialized", self.name)))?;

        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            while let Some(bytes) = inbound.recv().await {
                if sink.deliver(bytes).await.is_err() {
                    break;
                }
            }
            debug!(link = %name, "Loopback pump stopped");
        });

        *self
            .pump
            .lock()
            .map_err(|_| Error::Transport("loopback lock poisoned".into()))? = Some(handle);
        debug!(link = %self.name, "Loopback initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let handle = self
            .pump
            .lock()
            .map_err(|_| Error::Transport("loopback lock poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    async fn send_to(&self, bytes: &[u8], _recipient: PeerId) -> Result<()> {
        self.send(bytes)
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<()> {
        self.send(bytes)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InboundSink, TransportId};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (a, b) = LoopbackTransport::pair();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        a.initialize(InboundSink::new(TransportId(1), tx_a)).await.expect("init a");
        b.initialize(InboundSink::new(TransportId(2), tx_b)).await.expect("init b");

        a.broadcast(b"ping").await.expect("send");
        let frame = timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .expect("in time")
            .expect("frame");
        assert_eq!(frame.transport, TransportId(2));
        assert_eq!(frame.bytes, b"ping");

        b.send_to(b"pong", PeerId([0; 8])).await.expect("send");
        let frame = timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .expect("in time")
            .expect("frame");
        assert_eq!(frame.bytes, b"pong");
        assert_eq!(a.frames_sent(), 1);
    }

    #[tokio::test]
    async fn test_queued_before_initialize() {
        let (a, b) = LoopbackTransport::pair();
        a.broadcast(b"early").await.expect("send");

        let (tx, mut rx) = mpsc::channel(8);
        b.initialize(InboundSink::new(TransportId(0), tx)).await.expect("init");
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("in time")
            .expect("frame");
        assert_eq!(frame.bytes, b"early");
    }

    #[tokio::test]
    async fn test_double_initialize_fails() {
        let (a, _b) = LoopbackTransport::pair();
        let (tx, _rx) = mpsc::channel(8);
        a.initialize(InboundSink::new(TransportId(0), tx.clone())).await.expect("init");
        assert!(a.initialize(InboundSink::new(TransportId(0), tx)).await.is_err());
    }

    #[tokio::test]
    async fn test_send_after_shutdown_or_drop_fails() {
        let (a, b) = LoopbackTransport::pair();
        a.shutdown().await.expect("shutdown");
        assert!(a.broadcast(b"x").await.is_err());

        drop(a);
        assert!(b.broadcast(b"x").await.is_err());
    }
}
