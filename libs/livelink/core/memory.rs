//! In-process transport
//!
//! [`InMemoryTransport`] plugs into the client like any other transport,
//! but every successful `open` hands the server side of the connection to a
//! [`PeerListener`]. Tests and simulations drive the backend from there:
//! read what the client sent, push envelopes back, inject faults or close.

use crate::core::envelope::Envelope;
use crate::traits::*;
use async_trait::async_trait;
use futures::channel::mpsc as frame_channel;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

struct MemoryInner {
    reachable: AtomicBool,
    open_attempts: AtomicU64,
    accept_tx: mpsc::UnboundedSender<PeerConnection>,
}

/// Transport whose peer lives in the same process
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<MemoryInner>,
}

impl InMemoryTransport {
    /// Create a reachable transport and the listener for its peer side
    pub fn new() -> (Self, PeerListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(MemoryInner {
                reachable: AtomicBool::new(true),
                open_attempts: AtomicU64::new(0),
                accept_tx,
            }),
        };
        (transport, PeerListener { accept_rx })
    }

    /// While unreachable, every `open` fails with `ConnectionRefused`
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Number of `open` calls so far, successful or not
    pub fn open_attempts(&self) -> u64 {
        self.inner.open_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream)> {
        let attempt = self.inner.open_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.is_reachable() {
            debug!(attempt, "In-memory peer unreachable");
            return Err(RealtimeError::ConnectionRefused(format!("{} is unreachable", url)));
        }

        let (client_tx, peer_rx) = frame_channel::unbounded::<Frame>();
        let (peer_tx, client_rx) = frame_channel::unbounded::<Result<Frame>>();

        let peer = PeerConnection {
            url: url.to_string(),
            inbound: peer_rx,
            outbound: peer_tx,
        };
        self.inner
            .accept_tx
            .send(peer)
            .map_err(|_| RealtimeError::ConnectionRefused("no peer is listening".into()))?;

        let sink = client_tx.sink_map_err(|e| RealtimeError::ConnectionClosed(e.to_string()));
        Ok((Box::pin(sink), Box::pin(client_rx)))
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

/// Accepts the peer side of each connection the client opens
pub struct PeerListener {
    accept_rx: mpsc::UnboundedReceiver<PeerConnection>,
}

impl PeerListener {
    pub async fn accept(&mut self) -> Option<PeerConnection> {
        self.accept_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<PeerConnection> {
        tokio::time::timeout(timeout, self.accept()).await.ok().flatten()
    }

    pub fn try_accept(&mut self) -> Option<PeerConnection> {
        self.accept_rx.try_recv().ok()
    }
}

/// Server side of one in-memory connection
///
/// Dropping it (or calling [`close`](Self::close)) ends the client's stream
/// the way a remote close would.
pub struct PeerConnection {
    url: String,
    inbound: frame_channel::UnboundedReceiver<Frame>,
    outbound: frame_channel::UnboundedSender<Result<Frame>>,
}

impl PeerConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame the client sent; `None` once the client closed its side
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.inbound.next().await
    }

    /// Next decodable envelope the client sent
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.recv_frame().await?;
            match Envelope::from_frame(&frame) {
                Ok(envelope) => return Some(envelope),
                Err(e) => debug!(error = %e, "Peer skipped undecodable frame"),
            }
        }
    }

    pub async fn recv_envelope_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.recv_envelope())
            .await
            .ok()
            .flatten()
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        self.outbound.unbounded_send(Ok(frame)).is_ok()
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_frame() {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    /// Deliver a transport fault to the client
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.outbound
            .unbounded_send(Err(RealtimeError::WebSocket(reason.into())))
            .is_ok()
    }

    /// Whether the client has dropped its receiving side
    pub fn is_client_gone(&self) -> bool {
        self.outbound.is_closed()
    }

    pub fn close(self) {
        self.outbound.close_channel();
    }
}
