use crate::core::builder::{states::NoUrl, RealtimeClientBuilder};
use crate::core::config::ClientConfig;
use crate::core::connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState};
use crate::core::dispatcher::{notify_all, Dispatcher, ListenerSet};
use crate::core::envelope::{Envelope, EnvelopeKind, Received};
use crate::core::heartbeat::{spawn_heartbeat, HeartbeatTask};
use crate::core::pong_tracker::{PingTracker, PongOutcome};
use crate::core::registry::{
    Subscription, SubscriptionDescriptor, SubscriptionHandle, SubscriptionRegistry,
};
use crate::traits::*;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Internal command messages from the facade to the connection driver
#[derive(Debug)]
enum ClientCommand {
    /// Write a frame if `epoch` is still the open connection
    Send { epoch: u64, frame: Frame },
    /// Close the transport and stop
    Disconnect,
}

/// Lifecycle notifications published by the client
///
/// Available both through the event channel (`try_recv_event`) and to
/// status listeners registered with `on_status`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A connection opened and subscriptions were replayed
    Connected { epoch: u64 },
    /// An open connection was lost or closed
    Disconnected { reason: String },
    /// A retry was scheduled
    Reconnecting {
        attempt: u32,
        max_attempts: Option<u32>,
        delay: Duration,
    },
    /// A heartbeat ping went unanswered
    HeartbeatTimeout { seq: u64 },
    /// The reconnection strategy ran out of attempts
    GaveUp { attempts: u32 },
    /// A connection attempt failed
    Error(String),
}

/// Client metrics snapshot
#[derive(Debug, Clone)]
pub struct Metrics {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub parse_errors: u64,
    pub listener_failures: u64,
    pub reconnect_count: u64,
    pub heartbeat_timeouts: u64,
    pub connection_state: ConnectionState,
    /// Consecutive failed or dropped connections
    pub attempts: u32,
    pub epoch: u64,
    pub last_rtt: Option<Duration>,
    pub last_open: Option<DateTime<Utc>>,
    /// Time since the current connection opened
    pub uptime: Option<Duration>,
}

/// State shared by the facade and the connection driver
struct Shared {
    config: ClientConfig,
    state: AtomicConnectionState,
    metrics: Arc<AtomicMetrics>,
    attempts: AtomicU32,
    /// Epoch of the most recently opened connection
    epoch: AtomicU64,
    /// Bumped by every connect/disconnect; a driver acts only while its
    /// generation is current
    generation: Mutex<u64>,
    registry: Mutex<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    status_listeners: RwLock<ListenerSet<ClientEvent>>,
    event_tx: Sender<ClientEvent>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        *self.generation.lock() == generation
    }

    /// Apply a state transition on behalf of `generation`
    ///
    /// Returns false (and changes nothing) if the driver was superseded.
    fn transition(&self, generation: u64, state: ConnectionState) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.state.set(state);
        true
    }

    fn publish(&self, generation: u64, event: ClientEvent) {
        if self.is_current(generation) {
            self.emit(event);
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event.clone());
        let listeners = self.status_listeners.read().snapshot();
        let failures = notify_all(&listeners, &event, "status");
        if failures > 0 {
            self.metrics.add_listener_failures(failures as u64);
        }
    }
}

struct DriverHandle {
    generation: u64,
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    task: JoinHandle<()>,
}

/// Reconnecting real-time client
///
/// One instance owns one logical stream to the gateway. The facade methods
/// are synchronous (apart from [`connect`](Self::connect)) and never block
/// on the network: a background driver task owns the transport, the
/// heartbeat and the reconnect timer, and the facade talks to it through a
/// command channel.
///
/// - Subscriptions live in a registry that survives reconnects and is
///   replayed, in insertion order, every time a connection opens.
/// - Frames queued on a connection that is gone are discarded, never
///   delivered to its successor.
/// - After `disconnect()` nothing from the old connection runs: no timer,
///   no heartbeat, no listener call.
///
/// # Example
/// ```ignore
/// let client = RealtimeClient::builder()
///     .url("ws://gateway:8080/ws/telemetry")
///     .build()?;
///
/// let on_sample = listener_fn(|received: &Received| println!("{:?}", received.envelope));
/// client.on(EnvelopeKind::Telemetry, &on_sample);
/// client.subscribe(SubscriptionDescriptor::tag_stream("T1"));
/// client.connect().await?;
/// ```
pub struct RealtimeClient {
    shared: Arc<Shared>,
    event_rx: Receiver<ClientEvent>,
    driver: Mutex<Option<DriverHandle>>,
}

impl RealtimeClient {
    /// Start building a client
    pub fn builder() -> RealtimeClientBuilder<NoUrl> {
        RealtimeClientBuilder::new()
    }

    /// Create an idle client from a validated configuration
    pub fn new(config: ClientConfig) -> Self {
        let metrics = Arc::new(AtomicMetrics::new());
        let (event_tx, event_rx) = unbounded();

        let shared = Shared {
            config,
            state: AtomicConnectionState::new(ConnectionState::Idle),
            dispatcher: Dispatcher::new(Arc::clone(&metrics)),
            metrics,
            attempts: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            generation: Mutex::new(0),
            registry: Mutex::new(SubscriptionRegistry::new()),
            status_listeners: RwLock::new(ListenerSet::new()),
            event_tx,
        };

        Self {
            shared: Arc::new(shared),
            event_rx,
            driver: Mutex::new(None),
        }
    }

    /// Open the stream
    ///
    /// Resolves once the connection is open and every registered
    /// subscription has been replayed. If the first attempt fails the error
    /// is returned, but the client keeps retrying in the background per its
    /// reconnection strategy; watch the state or the event channel.
    ///
    /// Returns at once when already open. Calling it while connecting or
    /// waiting to reconnect abandons that cycle and starts a fresh one with
    /// the attempt counter reset.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.state.is_open() {
            debug!("connect() while already open");
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut driver = self.driver.lock();
            let generation = {
                let mut current = self.shared.generation.lock();
                *current += 1;
                self.shared.state.set(ConnectionState::Connecting);
                *current
            };

            if let Some(previous) = driver.take() {
                debug!(generation = previous.generation, "Superseding connection driver");
                let _ = previous.command_tx.send(ClientCommand::Disconnect);
            }

            self.shared.attempts.store(0, Ordering::SeqCst);
            self.shared.config.reconnect_strategy.reset();

            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_client(
                Arc::clone(&self.shared),
                generation,
                command_rx,
                ready_tx,
            ));

            *driver = Some(DriverHandle {
                generation,
                command_tx,
                task,
            });
        }

        match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::ConnectionClosed(
                "connection attempt was cancelled".into(),
            )),
        }
    }

    /// Close the stream and stop reconnecting
    ///
    /// Takes effect immediately: the state is `Idle` when this returns, any
    /// pending reconnect timer is cancelled and no listener is invoked for
    /// the old connection afterwards. Idempotent.
    pub fn disconnect(&self) {
        let was_active = self.stop_driver();
        if was_active {
            info!(url = %self.shared.config.url, "Disconnected by client");
            self.shared.emit(ClientEvent::Disconnected {
                reason: "client requested disconnect".into(),
            });
        }
    }

    /// Disconnect and wait for the driver task to finish
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down realtime client");
        let handle = self.driver.lock().take();
        self.disconnect();

        if let Some(handle) = handle {
            let _ = handle.command_tx.send(ClientCommand::Disconnect);
            let _ = handle.task.await;
        }
        Ok(())
    }

    fn stop_driver(&self) -> bool {
        let handle = self.driver.lock().take();
        let was_active = {
            let mut current = self.shared.generation.lock();
            *current += 1;
            let previous = self.shared.state.get();
            self.shared.state.set(ConnectionState::Idle);
            previous.is_active()
        };

        if let Some(handle) = handle {
            let _ = handle.command_tx.send(ClientCommand::Disconnect);
        }
        was_active
    }

    /// Send an envelope on the open connection
    ///
    /// Returns false, and writes nothing, unless the state is `Open`. There
    /// is no offline queue.
    pub fn send(&self, envelope: Envelope) -> bool {
        if !self.shared.state.is_open() {
            debug!(kind = %envelope.kind(), "send() while not open, dropping envelope");
            return false;
        }

        match envelope.to_frame() {
            Ok(frame) => self.queue_frame(frame),
            Err(e) => {
                warn!(error = %e, "Failed to encode envelope");
                false
            }
        }
    }

    /// Request a write of `value` to `tag_id`; the result arrives as a
    /// `write_ack` envelope
    pub fn write_tag(&self, tag_id: impl Into<String>, value: impl Into<Value>) -> bool {
        self.send(Envelope::write(tag_id, value))
    }

    fn queue_frame(&self, frame: Frame) -> bool {
        let driver = self.driver.lock();
        let Some(handle) = driver.as_ref() else {
            return false;
        };
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        handle
            .command_tx
            .send(ClientCommand::Send { epoch, frame })
            .is_ok()
    }

    /// Register a subscription; idempotent per descriptor
    ///
    /// When open, the subscribe frame is sent right away; otherwise it goes
    /// out with the replay on the next open.
    pub fn subscribe(&self, descriptor: SubscriptionDescriptor) -> SubscriptionHandle {
        // The registry lock is held across the state check so the send
        // cannot interleave with a replay snapshot.
        let mut registry = self.shared.registry.lock();
        let (handle, inserted) = registry.add(descriptor.clone());

        if inserted {
            debug!(handle = %handle, subscription = %descriptor, "Subscription registered");
            if self.shared.state.is_open() {
                self.send(descriptor.subscribe_envelope());
            }
        }
        handle
    }

    /// Remove a subscription; returns false for an unknown handle
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut registry = self.shared.registry.lock();
        match registry.remove(handle) {
            Some(subscription) => {
                debug!(handle = %handle, "Subscription removed");
                if self.shared.state.is_open() {
                    self.send(subscription.descriptor.unsubscribe_envelope());
                }
                true
            }
            None => false,
        }
    }

    /// Snapshot of the registered subscriptions, in insertion order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.registry.lock().entries().to_vec()
    }

    /// Register a listener for one envelope kind
    ///
    /// Registering the same listener twice for a kind is a no-op; returns
    /// whether it was added.
    pub fn on(&self, kind: EnvelopeKind, listener: &ListenerRef<Received>) -> bool {
        self.shared.dispatcher.on(kind, listener)
    }

    /// Remove one listener, or all listeners of `kind` when `None`
    pub fn off(&self, kind: EnvelopeKind, listener: Option<&ListenerRef<Received>>) -> usize {
        self.shared.dispatcher.off(kind, listener)
    }

    pub fn listener_count(&self, kind: EnvelopeKind) -> usize {
        self.shared.dispatcher.listener_count(kind)
    }

    /// Register a lifecycle listener
    pub fn on_status(&self, listener: &ListenerRef<ClientEvent>) -> bool {
        self.shared.status_listeners.write().insert(listener)
    }

    pub fn off_status(&self, listener: Option<&ListenerRef<ClientEvent>>) -> usize {
        let mut listeners = self.shared.status_listeners.write();
        match listener {
            Some(listener) => usize::from(listeners.remove(listener)),
            None => listeners.clear(),
        }
    }

    /// Get current connection state
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.shared.state.is_open()
    }

    /// Consecutive failed or dropped connections since the last open
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Epoch of the most recently opened connection (0 = never opened)
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.shared.config.url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Get current metrics
    pub fn metrics(&self) -> Metrics {
        let metrics = &self.shared.metrics;
        let state = self.state();
        let last_open = metrics.last_open();
        let uptime = match (state, last_open) {
            (ConnectionState::Open, Some(opened)) => (Utc::now() - opened).to_std().ok(),
            _ => None,
        };

        Metrics {
            frames_sent: metrics.frames_sent(),
            frames_received: metrics.frames_received(),
            parse_errors: metrics.parse_errors(),
            listener_failures: metrics.listener_failures(),
            reconnect_count: metrics.reconnects(),
            heartbeat_timeouts: metrics.heartbeat_timeouts(),
            connection_state: state,
            attempts: self.attempts(),
            epoch: self.epoch(),
            last_rtt: metrics.last_rtt(),
            last_open,
            uptime,
        }
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv_event(&self) -> Option<ClientEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Receive an event (blocking; not for use on a runtime thread)
    pub fn recv_event(&self) -> std::result::Result<ClientEvent, crossbeam_channel::RecvError> {
        self.event_rx.recv()
    }

    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<ClientEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Clone of the event receiver, for consumers on other threads
    pub fn events(&self) -> Receiver<ClientEvent> {
        self.event_rx.clone()
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.stop_driver();
    }
}

/// Why a connection epoch ended
enum EpochEnd {
    /// Disconnect requested or driver superseded
    Stop,
    /// Lost the connection; eligible for reconnect
    Dropped(String),
}

enum OpenOutcome {
    Connected(FrameSink, FrameStream),
    Failed(RealtimeError),
    Cancelled,
}

/// Connection driver
///
/// Owns the transport for one generation of the client. Each loop turn is
/// one connection attempt; failed or dropped attempts are counted and the
/// reconnection strategy decides whether and when to try again.
async fn run_client(
    shared: Arc<Shared>,
    generation: u64,
    mut command_rx: mpsc::UnboundedReceiver<ClientCommand>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready_tx);
    let url = shared.config.url.clone();

    loop {
        if !shared.transition(generation, ConnectionState::Connecting) {
            debug!(generation, "Driver superseded before connecting");
            break;
        }
        info!(
            url = %url,
            transport = shared.config.transport.name(),
            attempt = shared.attempts.load(Ordering::SeqCst) + 1,
            "Connecting"
        );

        let reason = match open_transport(&shared, &mut command_rx).await {
            OpenOutcome::Cancelled => break,
            OpenOutcome::Failed(e) => {
                error!(url = %url, error = %e, "Failed to connect");
                shared.publish(generation, ClientEvent::Error(e.to_string()));
                let reason = e.to_string();
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e));
                }
                reason
            }
            OpenOutcome::Connected(sink, stream) => {
                match handle_connection(&shared, generation, sink, stream, &mut command_rx, &mut ready)
                    .await
                {
                    EpochEnd::Stop => break,
                    EpochEnd::Dropped(reason) => {
                        warn!(url = %url, reason = %reason, "Connection lost");
                        if !shared.transition(generation, ConnectionState::Closing) {
                            break;
                        }
                        shared.publish(
                            generation,
                            ClientEvent::Disconnected {
                                reason: reason.clone(),
                            },
                        );
                        reason
                    }
                }
            }
        };

        if !shared.is_current(generation) {
            break;
        }
        let failures = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let strategy = &shared.config.reconnect_strategy;

        if !shared.config.auto_reconnect || !strategy.should_reconnect(failures) {
            warn!(attempts = failures, reason = %reason, "Reconnection strategy exhausted, giving up");
            if shared.transition(generation, ConnectionState::Idle) {
                shared.publish(generation, ClientEvent::GaveUp { attempts: failures });
            }
            break;
        }

        let delay = strategy.next_delay(failures - 1);
        if !shared.transition(generation, ConnectionState::Reconnecting) {
            break;
        }
        shared.metrics.increment_reconnects();
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            failures,
            strategy
                .max_attempts()
                .map_or_else(|| "unlimited".to_string(), |max| max.to_string())
        );
        shared.publish(
            generation,
            ClientEvent::Reconnecting {
                attempt: failures,
                max_attempts: strategy.max_attempts(),
                delay,
            },
        );

        if !wait_for_retry(&shared, generation, delay, &mut command_rx).await {
            break;
        }
    }

    debug!(generation, "Client task exiting");
}

/// One bounded `Transport::open`, abandoned early on disconnect
async fn open_transport(
    shared: &Arc<Shared>,
    command_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
) -> OpenOutcome {
    let transport = Arc::clone(&shared.config.transport);
    let url = shared.config.url.clone();
    let timeout = shared.config.connect_timeout;

    let attempt = tokio::time::timeout(timeout, async move { transport.open(&url).await });
    tokio::pin!(attempt);

    loop {
        tokio::select! {
            result = &mut attempt => {
                return match result {
                    Ok(Ok((sink, stream))) => OpenOutcome::Connected(sink, stream),
                    Ok(Err(e)) => OpenOutcome::Failed(e),
                    Err(_) => OpenOutcome::Failed(RealtimeError::Timeout(format!(
                        "open did not complete within {:?}",
                        timeout
                    ))),
                };
            }
            command = command_rx.recv() => match command {
                Some(ClientCommand::Send { .. }) => debug!("Discarding frame queued while connecting"),
                Some(ClientCommand::Disconnect) | None => return OpenOutcome::Cancelled,
            }
        }
    }
}

/// Sleep out the backoff delay; false if the driver must stop instead
async fn wait_for_retry(
    shared: &Arc<Shared>,
    generation: u64,
    delay: Duration,
    command_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return shared.is_current(generation),
            command = command_rx.recv() => match command {
                Some(ClientCommand::Send { .. }) => debug!("Discarding frame queued while reconnecting"),
                Some(ClientCommand::Disconnect) | None => {
                    debug!("Reconnect timer cancelled");
                    return false;
                }
            }
        }
    }
}

/// Handle an open connection until it ends
async fn handle_connection(
    shared: &Arc<Shared>,
    generation: u64,
    mut sink: FrameSink,
    stream: FrameStream,
    command_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    ready: &mut Option<oneshot::Sender<Result<()>>>,
) -> EpochEnd {
    let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;

    // Going Open and snapshotting the registry happen under the registry
    // lock: a concurrent subscribe either lands in the snapshot or sees Open
    // and sends on this epoch after the replay.
    let replay = {
        let registry = shared.registry.lock();
        if shared.transition(generation, ConnectionState::Open) {
            shared.attempts.store(0, Ordering::SeqCst);
            Some(registry.replay_all())
        } else {
            None
        }
    };
    let Some(replay) = replay else {
        let _ = sink.close().await;
        return EpochEnd::Stop;
    };

    shared.config.reconnect_strategy.reset();
    shared.metrics.record_open(Utc::now());
    info!(url = %shared.config.url, epoch, "Connected");

    let heartbeat = shared
        .config
        .heartbeat
        .map(|heartbeat| spawn_heartbeat(heartbeat.interval, epoch));
    let tracker = PingTracker::new(
        shared
            .config
            .heartbeat
            .map(|heartbeat| heartbeat.timeout)
            .unwrap_or_default(),
    );

    for envelope in &replay {
        if let Err(e) = write_envelope(shared, &mut sink, envelope).await {
            let reason = format!("subscription replay failed: {}", e);
            if let Some(ready) = ready.take() {
                let _ = ready.send(Err(e));
            }
            return EpochEnd::Dropped(reason);
        }
    }
    if !replay.is_empty() {
        debug!(epoch, count = replay.len(), "Replayed subscriptions");
    }

    shared.publish(generation, ClientEvent::Connected { epoch });
    if let Some(ready) = ready.take() {
        let _ = ready.send(Ok(()));
    }

    let end = message_loop(
        shared, generation, epoch, sink, stream, command_rx, heartbeat, tracker,
    )
    .await;

    debug!(epoch, "Connection epoch ended");
    end
}

/// Main message processing loop
#[allow(clippy::too_many_arguments)]
async fn message_loop(
    shared: &Arc<Shared>,
    generation: u64,
    epoch: u64,
    mut sink: FrameSink,
    mut stream: FrameStream,
    command_rx: &mut mpsc::UnboundedReceiver<ClientCommand>,
    mut heartbeat: Option<HeartbeatTask>,
    mut tracker: PingTracker,
) -> EpochEnd {
    loop {
        let deadline = tracker.deadline();

        tokio::select! {
            biased;

            // Handle commands from the facade
            command = command_rx.recv() => match command {
                Some(ClientCommand::Send { epoch: queued_on, frame }) => {
                    if queued_on != epoch {
                        debug!(queued_on, epoch, "Discarding frame queued on a previous connection");
                        continue;
                    }
                    if let Err(e) = write_frame(shared, &mut sink, frame).await {
                        error!(error = %e, "Failed to write frame");
                        return EpochEnd::Dropped(e.to_string());
                    }
                }
                Some(ClientCommand::Disconnect) | None => {
                    info!(epoch, "Received disconnect command, closing transport");
                    drop(heartbeat.take());
                    let _ = sink.close().await;
                    return EpochEnd::Stop;
                }
            },

            // Heartbeat ticks from the dedicated ticker task
            tick = next_tick(&mut heartbeat) => {
                if tick != epoch || !shared.is_current(generation) {
                    continue;
                }
                let seq = tracker.next_ping(Instant::now());
                if let Err(e) = write_envelope(shared, &mut sink, &Envelope::ping(seq)).await {
                    error!(error = %e, "Failed to send heartbeat");
                    return EpochEnd::Dropped(e.to_string());
                }
                debug!(seq, "Heartbeat ping sent");
            },

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let seq = tracker.outstanding_seq().unwrap_or_default();
                warn!(seq, epoch, "Heartbeat pong not received before deadline, closing transport");
                drop(heartbeat.take());
                shared.metrics.increment_heartbeat_timeouts();
                shared.transition(generation, ConnectionState::Closing);
                shared.publish(generation, ClientEvent::HeartbeatTimeout { seq });
                let _ = sink.close().await;
                return EpochEnd::Dropped(format!("heartbeat timeout (seq {})", seq));
            }

            // Handle incoming frames
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = handle_frame(shared, generation, epoch, frame, &mut sink, &mut tracker).await {
                        error!(error = %e, "Failed to answer server ping");
                        return EpochEnd::Dropped(e.to_string());
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Transport error");
                    return EpochEnd::Dropped(e.to_string());
                }
                None => {
                    warn!("Transport stream closed");
                    return EpochEnd::Dropped("stream ended".into());
                }
            },
        }
    }
}

async fn next_tick(heartbeat: &mut Option<HeartbeatTask>) -> u64 {
    match heartbeat {
        Some(task) => match task.tick().await {
            Some(epoch) => epoch,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

/// Decode, answer pings, track pongs and dispatch one inbound frame
async fn handle_frame(
    shared: &Arc<Shared>,
    generation: u64,
    epoch: u64,
    frame: Frame,
    sink: &mut FrameSink,
    tracker: &mut PingTracker,
) -> Result<()> {
    shared.metrics.increment_received();
    let Some(envelope) = shared.dispatcher.decode(&frame) else {
        return Ok(());
    };

    match &envelope {
        Envelope::Pong { seq } => match tracker.on_pong(*seq, Instant::now()) {
            PongOutcome::Matched { rtt } => {
                shared.metrics.record_rtt(rtt);
                debug!(seq, rtt_ms = rtt.as_millis() as u64, "Heartbeat pong received");
            }
            PongOutcome::Stale => debug!(seq, "Ignoring stale pong"),
            PongOutcome::Unexpected => debug!(seq, "Ignoring pong for a ping never sent"),
        },
        Envelope::Ping { seq, .. } if shared.config.answer_server_pings => {
            write_envelope(shared, sink, &Envelope::pong(*seq)).await?;
            debug!(seq, "Answered server ping");
        }
        _ => {}
    }

    if !shared.is_current(generation) {
        debug!(epoch, "Client disconnected, skipping dispatch");
        return Ok(());
    }
    let received = Received {
        envelope,
        received_at: Utc::now(),
        epoch,
    };
    shared.dispatcher.dispatch(&received);
    Ok(())
}

async fn write_envelope(shared: &Arc<Shared>, sink: &mut FrameSink, envelope: &Envelope) -> Result<()> {
    let frame = envelope.to_frame()?;
    write_frame(shared, sink, frame).await
}

async fn write_frame(shared: &Arc<Shared>, sink: &mut FrameSink, frame: Frame) -> Result<()> {
    sink.send(frame).await?;
    shared.metrics.increment_sent();
    Ok(())
}
