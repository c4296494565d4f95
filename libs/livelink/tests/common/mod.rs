//! Common test utilities for LiveLink integration tests
//!
//! Two kinds of backend are provided:
//! - [`MockWsServer`]: a real WebSocket server on localhost that answers
//!   heartbeat pings and records everything else
//! - [`AutoPeer`]: drives the peer side of an [`InMemoryTransport`]
//!   connection from a background task

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use livelink::{
    ClientEvent, ConnectionState, Envelope, EnvelopeKind, Frame, PeerConnection, PeerListener,
    RealtimeClient,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// A mock gateway WebSocket server for testing
pub struct MockWsServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    received_rx: mpsc::UnboundedReceiver<Envelope>,
    push_tx: broadcast::Sender<String>,
    connections: Arc<AtomicUsize>,
    authorization: Arc<Mutex<Vec<String>>>,
}

impl MockWsServer {
    /// Create and start a new mock server
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (push_tx, _) = broadcast::channel(64);
        let connections = Arc::new(AtomicUsize::new(0));
        let authorization = Arc::new(Mutex::new(Vec::new()));

        let shutdown_clone = shutdown.clone();
        let push = push_tx.clone();
        let accepted = connections.clone();
        let auth_log = authorization.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                accepted.fetch_add(1, Ordering::SeqCst);
                                let shutdown = shutdown_clone.clone();
                                let received_tx = received_tx.clone();
                                let push_rx = push.subscribe();
                                let auth_log = auth_log.clone();
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, shutdown, received_tx, push_rx, auth_log).await;
                                });
                            }
                            Err(e) => {
                                eprintln!("Accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown,
            received_rx,
            push_tx,
            connections,
            authorization,
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        shutdown: Arc<Notify>,
        received_tx: mpsc::UnboundedSender<Envelope>,
        mut push_rx: broadcast::Receiver<String>,
        auth_log: Arc<Mutex<Vec<String>>>,
    ) {
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
        use tokio_tungstenite::tungstenite::Message;

        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if let Some(value) = request.headers().get("authorization") {
                auth_log
                    .lock()
                    .push(value.to_str().unwrap_or_default().to_string());
            }
            Ok(response)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match Envelope::from_json(&text) {
                                Ok(Envelope::Ping { seq, .. }) => {
                                    let pong = Envelope::pong(seq).to_json().unwrap();
                                    if write.send(Message::Text(pong)).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(envelope) => {
                                    let _ = received_tx.send(envelope);
                                }
                                Err(e) => eprintln!("Mock server got undecodable frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                pushed = push_rx.recv() => {
                    match pushed {
                        Ok(text) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
    }

    /// Get the WebSocket URL for this server
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send an envelope to every connected client
    pub fn push(&self, envelope: &Envelope) {
        let _ = self.push_tx.send(envelope.to_json().unwrap());
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn authorization_headers(&self) -> Vec<String> {
        self.authorization.lock().clone()
    }

    /// Next envelope (other than a ping) any client sent
    pub async fn next_received(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum PeerCommand {
    Send(Frame),
    Fail(String),
    Close,
}

/// Background-driven peer side of an in-memory connection
///
/// Answers heartbeat pings (unless told not to) and forwards every other
/// envelope the client sends.
pub struct AutoPeer {
    received: mpsc::UnboundedReceiver<Envelope>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    answer_pings: Arc<AtomicBool>,
    pings_seen: Arc<AtomicUsize>,
}

impl AutoPeer {
    pub fn spawn(peer: PeerConnection) -> Self {
        Self::spawn_with(peer, true)
    }

    pub fn spawn_with(mut peer: PeerConnection, answer_pings: bool) -> Self {
        let (received_tx, received) = mpsc::unbounded_channel();
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let answer_pings = Arc::new(AtomicBool::new(answer_pings));
        let pings_seen = Arc::new(AtomicUsize::new(0));

        let answer = answer_pings.clone();
        let pings = pings_seen.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    envelope = peer.recv_envelope() => match envelope {
                        Some(Envelope::Ping { seq, .. }) => {
                            pings.fetch_add(1, Ordering::SeqCst);
                            if answer.load(Ordering::SeqCst) {
                                peer.send_envelope(&Envelope::pong(seq));
                            }
                        }
                        Some(envelope) => {
                            let _ = received_tx.send(envelope);
                        }
                        None => break,
                    },
                    command = command_rx.recv() => match command {
                        Some(PeerCommand::Send(frame)) => {
                            peer.send_frame(frame);
                        }
                        Some(PeerCommand::Fail(reason)) => {
                            peer.fail(reason);
                        }
                        Some(PeerCommand::Close) | None => {
                            peer.close();
                            break;
                        }
                    }
                }
            }
        });

        Self {
            received,
            commands,
            answer_pings,
            pings_seen,
        }
    }

    pub fn push(&self, envelope: &Envelope) {
        let _ = self
            .commands
            .send(PeerCommand::Send(envelope.to_frame().unwrap()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.commands.send(PeerCommand::Send(Frame::from(text)));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.commands.send(PeerCommand::Fail(reason.to_string()));
    }

    pub fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.answer_pings.store(answer, Ordering::SeqCst);
    }

    pub fn pings_seen(&self) -> usize {
        self.pings_seen.load(Ordering::SeqCst)
    }

    pub async fn next_envelope(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next envelope of `kind`, skipping others
    pub async fn next_of_kind(&mut self, kind: EnvelopeKind, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let envelope = self.next_envelope(remaining).await?;
            if envelope.kind() == kind {
                return Some(envelope);
            }
        }
    }
}

/// Accept the next in-memory connection and drive it with an [`AutoPeer`]
pub async fn accept_peer(listener: &mut PeerListener) -> AutoPeer {
    let peer = listener
        .accept_timeout(Duration::from_secs(2))
        .await
        .expect("client should open a connection");
    AutoPeer::spawn(peer)
}

/// Poll until the client reaches `state`
pub async fn wait_for_state(client: &RealtimeClient, state: ConnectionState, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if client.state() == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client.state() == state
}

/// Poll the event channel until an event matches, dropping the others
pub async fn wait_for_event<F>(client: &RealtimeClient, timeout: Duration, mut predicate: F) -> Option<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        while let Some(event) = client.try_recv_event() {
            if predicate(&event) {
                return Some(event);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    None
}

/// Test fixture for connection states
pub mod fixtures {
    use livelink::core::connection_state::{AtomicConnectionState, ConnectionState};

    pub fn idle_state() -> AtomicConnectionState {
        AtomicConnectionState::new(ConnectionState::Idle)
    }
}
