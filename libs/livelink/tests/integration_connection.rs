//! Integration tests for connection management
//!
//! State/metrics primitives plus end-to-end client behaviour against the
//! in-memory transport: subscription replay, heartbeat timeouts, give-up,
//! listener lifecycle and disconnect semantics.

mod common;

use common::{accept_peer, wait_for_event, wait_for_state};
use futures::SinkExt;
use livelink::core::connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState};
use livelink::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Macro for verbose test output
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

const WAIT: Duration = Duration::from_secs(2);

fn memory_client(transport: InMemoryTransport) -> RealtimeClient {
    livelink::builder()
        .url("memory://gateway")
        .transport(transport)
        .no_heartbeat()
        .reconnect_strategy(FixedDelay::new(Duration::from_millis(20), Some(10)))
        .build()
        .unwrap()
}

fn counting_listener() -> (Arc<AtomicUsize>, ListenerRef<Received>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let listener = listener_fn(move |_: &Received| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (count, listener)
}

/// Opens every time, but the peer never reads: each write fails
struct WriteRejectingTransport {
    opens: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Transport for WriteRejectingTransport {
    async fn open(&self, _url: &str) -> Result<(FrameSink, FrameStream)> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (frame_tx, frame_rx) = futures::channel::mpsc::unbounded::<Frame>();
        drop(frame_rx);

        let sink = frame_tx.sink_map_err(|e| RealtimeError::ConnectionClosed(e.to_string()));
        let stream = futures::stream::pending::<Result<Frame>>();
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

fn telemetry(tag_id: &str, value: f64) -> Envelope {
    Envelope::Telemetry {
        tag_id: tag_id.to_string(),
        value: json!(value),
        quality: "good".into(),
        timestamp: chrono::Utc::now(),
    }
}

#[test]
fn test_connection_state_full_lifecycle() {
    verbose_println!("Testing full connection lifecycle...");

    let state = AtomicConnectionState::new(ConnectionState::Idle);
    assert!(!state.get().is_active());

    state.set(ConnectionState::Connecting);
    assert!(state.get().is_active());
    assert!(!state.is_open());

    state.set(ConnectionState::Open);
    assert!(state.is_open());

    state.set(ConnectionState::Closing);
    assert!(!state.is_open());
    assert!(state.get().is_active());

    state.set(ConnectionState::Reconnecting);
    assert_eq!(state.get(), ConnectionState::Reconnecting);

    state.set(ConnectionState::Idle);
    assert_eq!(state.get(), ConnectionState::Idle);
    verbose_println!("  Lifecycle complete");
}

#[test]
fn test_concurrent_state_access() {
    verbose_println!("Testing concurrent state access...");

    let state = Arc::new(common::fixtures::idle_state());
    let metrics = Arc::new(AtomicMetrics::new());
    let mut handles = vec![];

    for _ in 0..5 {
        let state_clone = Arc::clone(&state);
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                let _ = state_clone.get();
                let _ = state_clone.is_open();
            }
        }));
    }

    for _ in 0..3 {
        let state_clone = Arc::clone(&state);
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                state_clone.set(ConnectionState::Open);
                state_clone.set(ConnectionState::Reconnecting);
            }
        }));
    }

    for _ in 0..5 {
        let metrics_clone = Arc::clone(&metrics);
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                metrics_clone.increment_sent();
                metrics_clone.increment_received();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(metrics.frames_sent(), 5000);
    assert_eq!(metrics.frames_received(), 5000);
}

#[tokio::test]
async fn test_connect_subscribe_and_receive() {
    verbose_println!("Testing connect, subscribe and receive...");

    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);
    let (count, on_telemetry) = counting_listener();
    client.on(EnvelopeKind::Telemetry, &on_telemetry);

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.attempts(), 0);
    let mut peer = accept_peer(&mut listener).await;

    client.subscribe(SubscriptionDescriptor::tag_stream("T1"));
    assert_eq!(
        peer.next_envelope(WAIT).await,
        Some(Envelope::subscribe(Topic::TagStream, Scope::tag("T1")))
    );

    peer.push(&telemetry("T1", 21.5));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(client.attempts(), 0);
    assert_eq!(client.metrics().frames_received, 1);
}

#[tokio::test]
async fn test_replay_after_drop_in_insertion_order() {
    verbose_println!("Testing subscription replay after a dropped connection...");

    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport.clone());
    client.connect().await.unwrap();
    let mut first = accept_peer(&mut listener).await;

    client.subscribe(SubscriptionDescriptor::tag_stream("T1"));
    client.subscribe(SubscriptionDescriptor::tag_stream("T2"));
    assert!(first.next_envelope(WAIT).await.is_some());
    assert!(first.next_envelope(WAIT).await.is_some());

    first.close();
    let event = wait_for_event(&client, WAIT, |event| matches!(event, ClientEvent::Disconnected { .. })).await;
    assert!(event.is_some(), "drop should be reported");

    let mut second = accept_peer(&mut listener).await;
    assert_eq!(
        second.next_envelope(WAIT).await,
        Some(Envelope::subscribe(Topic::TagStream, Scope::tag("T1")))
    );
    assert_eq!(
        second.next_envelope(WAIT).await,
        Some(Envelope::subscribe(Topic::TagStream, Scope::tag("T2")))
    );
    assert!(second.next_envelope(Duration::from_millis(100)).await.is_none());

    assert!(wait_for_state(&client, ConnectionState::Open, WAIT).await);
    assert_eq!(client.attempts(), 0);
    assert_eq!(transport.open_attempts(), 2);
    verbose_println!("  Replayed 2 subscriptions in order");
}

#[tokio::test]
async fn test_subscriptions_registered_while_closed_are_sent_on_open() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);

    client.subscribe(SubscriptionDescriptor::alerts());
    client.subscribe(SubscriptionDescriptor::device_status("D7"));

    client.connect().await.unwrap();
    let mut peer = accept_peer(&mut listener).await;

    assert_eq!(
        peer.next_envelope(WAIT).await,
        Some(Envelope::subscribe(Topic::Alerts, Scope::new()))
    );
    assert_eq!(
        peer.next_envelope(WAIT).await,
        Some(Envelope::subscribe(Topic::DeviceStatus, Scope::device("D7")))
    );
}

#[tokio::test]
async fn test_heartbeat_timeout_forces_reconnect() {
    verbose_println!("Testing heartbeat timeout...");

    let (transport, mut listener) = InMemoryTransport::new();
    let client = livelink::builder()
        .url("memory://gateway")
        .transport(transport)
        .heartbeat(Duration::from_millis(100), Duration::from_millis(50))
        .reconnect_strategy(FixedDelay::new(Duration::from_millis(20), Some(10)))
        .build()
        .unwrap();

    client.connect().await.unwrap();
    let peer = common::AutoPeer::spawn_with(
        listener.accept_timeout(WAIT).await.expect("first connection"),
        false,
    );

    let timeout = wait_for_event(&client, WAIT, |event| matches!(event, ClientEvent::HeartbeatTimeout { .. })).await;
    assert_eq!(timeout, Some(ClientEvent::HeartbeatTimeout { seq: 1 }));
    assert!(peer.pings_seen() >= 1);

    let reconnecting = wait_for_event(&client, WAIT, |event| matches!(event, ClientEvent::Reconnecting { .. })).await;
    assert!(matches!(
        reconnecting,
        Some(ClientEvent::Reconnecting { attempt: 1, max_attempts: Some(10), .. })
    ));

    // the next connection answers pings and stays up
    let _second = accept_peer(&mut listener).await;
    assert!(wait_for_state(&client, ConnectionState::Open, WAIT).await);
    assert_eq!(client.metrics().heartbeat_timeouts, 1);
}

#[tokio::test]
async fn test_pongs_keep_connection_alive_and_record_rtt() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = livelink::builder()
        .url("memory://gateway")
        .transport(transport.clone())
        .heartbeat(Duration::from_millis(50), Duration::from_millis(40))
        .build()
        .unwrap();

    client.connect().await.unwrap();
    let peer = accept_peer(&mut listener).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(peer.pings_seen() >= 3);
    assert!(client.is_connected());
    assert_eq!(transport.open_attempts(), 1);
    assert!(client.metrics().last_rtt.is_some());
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    verbose_println!("Testing give-up after max attempts...");

    let (transport, _listener) = InMemoryTransport::new();
    transport.set_reachable(false);
    let client = livelink::builder()
        .url("memory://gateway")
        .transport(transport.clone())
        .no_heartbeat()
        .reconnect_strategy(FixedDelay::new(Duration::from_millis(10), Some(10)))
        .build()
        .unwrap();

    assert!(client.connect().await.is_err());

    let gave_up = wait_for_event(&client, Duration::from_secs(3), |event| matches!(event, ClientEvent::GaveUp { .. })).await;
    assert_eq!(gave_up, Some(ClientEvent::GaveUp { attempts: 10 }));
    assert_eq!(client.attempts(), 10);
    assert_eq!(client.state(), ConnectionState::Idle);
    assert_eq!(transport.open_attempts(), 10);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.open_attempts(), 10, "no attempts after giving up");
    verbose_println!("  Gave up after {} attempts", client.attempts());
}

#[tokio::test]
async fn test_connect_after_give_up_resets_attempts() {
    let (transport, mut listener) = InMemoryTransport::new();
    transport.set_reachable(false);
    let client = livelink::builder()
        .url("memory://gateway")
        .transport(transport.clone())
        .no_heartbeat()
        .reconnect_strategy(FixedDelay::new(Duration::from_millis(5), Some(3)))
        .build()
        .unwrap();

    assert!(client.connect().await.is_err());
    assert!(wait_for_event(&client, WAIT, |event| matches!(event, ClientEvent::GaveUp { .. })).await.is_some());
    assert_eq!(client.attempts(), 3);

    transport.set_reachable(true);
    client.connect().await.unwrap();
    let _peer = accept_peer(&mut listener).await;
    assert_eq!(client.attempts(), 0);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_listener_registration_is_idempotent() {
    verbose_println!("Testing repeated listener registration...");

    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);
    let (count, on_alert) = counting_listener();

    for _ in 0..5 {
        client.on(EnvelopeKind::Alert, &on_alert);
        assert_eq!(client.listener_count(EnvelopeKind::Alert), 1);
        client.off(EnvelopeKind::Alert, Some(&on_alert));
        assert_eq!(client.listener_count(EnvelopeKind::Alert), 0);
    }
    client.on(EnvelopeKind::Alert, &on_alert);
    client.on(EnvelopeKind::Alert, &on_alert);

    client.connect().await.unwrap();
    let peer = accept_peer(&mut listener).await;
    peer.push(&Envelope::Alert {
        event_id: "E1".into(),
        severity: "critical".into(),
        message: "over temperature".into(),
        timestamp: chrono::Utc::now(),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    assert_eq!(client.off(EnvelopeKind::Alert, None), 1);
    assert_eq!(client.listener_count(EnvelopeKind::Alert), 0);
}

#[tokio::test]
async fn test_send_while_closed_returns_false() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);

    assert!(!client.send(Envelope::pong(1)));
    assert!(!client.write_tag("T1", 5));

    client.connect().await.unwrap();
    let mut peer = accept_peer(&mut listener).await;
    assert!(client.write_tag("T1", 5));
    assert_eq!(peer.next_envelope(WAIT).await, Some(Envelope::write("T1", 5)));

    client.disconnect();
    assert!(!client.send(Envelope::write("T1", 6)));
}

#[tokio::test]
async fn test_subscribe_is_idempotent_on_the_wire() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);
    client.connect().await.unwrap();
    let mut peer = accept_peer(&mut listener).await;

    let first = client.subscribe(SubscriptionDescriptor::tag_stream("T1"));
    let second = client.subscribe(SubscriptionDescriptor::tag_stream("T1"));
    assert_eq!(first, second);
    assert_eq!(client.subscriptions().len(), 1);

    assert!(peer.next_envelope(WAIT).await.is_some());
    assert!(peer.next_envelope(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_unsubscribe() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);
    client.connect().await.unwrap();
    let mut peer = accept_peer(&mut listener).await;

    let handle = client.subscribe(SubscriptionDescriptor::device_status("D1"));
    peer.next_of_kind(EnvelopeKind::Subscribe, WAIT).await.unwrap();

    assert!(client.unsubscribe(&handle));
    assert_eq!(
        peer.next_envelope(WAIT).await,
        Some(Envelope::unsubscribe(Topic::DeviceStatus, Scope::device("D1")))
    );
    assert!(!client.unsubscribe(&handle));
    assert!(client.subscriptions().is_empty());
}

#[tokio::test]
async fn test_disconnect_cancels_pending_reconnect() {
    verbose_println!("Testing disconnect during backoff...");

    let (transport, _listener) = InMemoryTransport::new();
    transport.set_reachable(false);
    let client = livelink::builder()
        .url("memory://gateway")
        .transport(transport.clone())
        .no_heartbeat()
        .reconnect_strategy(FixedDelay::new(Duration::from_millis(200), None))
        .build()
        .unwrap();

    assert!(client.connect().await.is_err());
    assert!(wait_for_state(&client, ConnectionState::Reconnecting, WAIT).await);

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Idle);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(transport.open_attempts(), 1);
    assert_eq!(client.state(), ConnectionState::Idle);

    // idempotent
    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn test_no_dispatch_after_disconnect() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);
    let (count, on_telemetry) = counting_listener();
    client.on(EnvelopeKind::Telemetry, &on_telemetry);

    client.connect().await.unwrap();
    let peer = accept_peer(&mut listener).await;

    client.disconnect();
    peer.push(&telemetry("T1", 1.0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(client.state(), ConnectionState::Idle);
    assert!(listener.try_accept().is_none(), "no reconnect after disconnect");
}

#[tokio::test]
async fn test_malformed_and_unknown_frames() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);
    let (known, on_telemetry) = counting_listener();
    let (unknown, on_unknown) = counting_listener();
    client.on(EnvelopeKind::Telemetry, &on_telemetry);
    client.on(EnvelopeKind::Unknown, &on_unknown);

    client.connect().await.unwrap();
    let peer = accept_peer(&mut listener).await;

    peer.push_raw("{not json");
    peer.push_raw(r#"{"type":"statistics_update","online":4}"#);
    peer.push(&telemetry("T1", 3.0));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(known.load(Ordering::SeqCst), 1);
    assert_eq!(unknown.load(Ordering::SeqCst), 1);
    let metrics = client.metrics();
    assert_eq!(metrics.parse_errors, 1);
    assert_eq!(metrics.frames_received, 3);
    assert!(client.is_connected(), "bad frames do not drop the connection");
}

#[tokio::test]
async fn test_failing_listener_does_not_block_others() {
    verbose_println!("Testing listener isolation over 100 frames...");

    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);

    let panicking = listener_fn(|_: &Received| panic!("listener bug"));
    let (count, healthy) = counting_listener();
    client.on(EnvelopeKind::Telemetry, &panicking);
    client.on(EnvelopeKind::Telemetry, &healthy);

    client.connect().await.unwrap();
    let peer = accept_peer(&mut listener).await;
    for i in 0..100 {
        peer.push(&telemetry("T1", i as f64));
    }

    let deadline = tokio::time::Instant::now() + WAIT;
    while count.load(Ordering::SeqCst) < 100 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(count.load(Ordering::SeqCst), 100);
    assert_eq!(client.metrics().listener_failures, 100);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_backoff_restarts_after_open() {
    verbose_println!("Testing backoff reset after a successful open...");

    let (transport, mut listener) = InMemoryTransport::new();
    transport.set_reachable(false);
    let client = livelink::builder()
        .url("memory://gateway")
        .transport(transport.clone())
        .no_heartbeat()
        .reconnect_strategy(ExponentialBackoff::new(
            Duration::from_millis(20),
            Duration::from_secs(1),
            None,
        ))
        .build()
        .unwrap();

    assert!(client.connect().await.is_err());
    let second = wait_for_event(&client, WAIT, |event| {
        matches!(event, ClientEvent::Reconnecting { attempt: 2, .. })
    })
    .await;
    assert!(matches!(
        second,
        Some(ClientEvent::Reconnecting { delay, .. }) if delay == Duration::from_millis(40)
    ));

    transport.set_reachable(true);
    let peer = accept_peer(&mut listener).await;
    assert!(wait_for_state(&client, ConnectionState::Open, WAIT).await);
    assert_eq!(client.attempts(), 0);

    peer.fail("link down");
    let after_open = wait_for_event(&client, WAIT, |event| matches!(event, ClientEvent::Reconnecting { .. })).await;
    assert_eq!(
        after_open,
        Some(ClientEvent::Reconnecting {
            attempt: 1,
            max_attempts: None,
            delay: Duration::from_millis(20),
        })
    );
}

#[tokio::test]
async fn test_server_ping_is_answered() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);
    client.connect().await.unwrap();

    let mut peer = listener.accept_timeout(WAIT).await.unwrap();
    peer.send_envelope(&Envelope::ping(42));
    assert_eq!(peer.recv_envelope_timeout(WAIT).await, Some(Envelope::pong(42)));
}

#[tokio::test]
async fn test_transport_fault_triggers_reconnect() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);
    client.connect().await.unwrap();
    let first = accept_peer(&mut listener).await;
    let first_epoch = client.epoch();

    first.fail("connection reset by peer");
    let _second = accept_peer(&mut listener).await;
    assert!(wait_for_state(&client, ConnectionState::Open, WAIT).await);
    assert!(client.epoch() > first_epoch);
    assert_eq!(client.metrics().reconnect_count, 1);
}

#[tokio::test]
async fn test_drop_is_reported_after_leaving_open() {
    verbose_println!("Testing state seen by status listeners on a dropped connection...");

    let (transport, mut listener) = InMemoryTransport::new();
    let client = Arc::new(memory_client(transport));
    let observed = Arc::new(Mutex::new(Vec::new()));

    let weak = Arc::downgrade(&client);
    let seen = Arc::clone(&observed);
    let on_status = listener_fn(move |event: &ClientEvent| {
        if !matches!(event, ClientEvent::Disconnected { .. }) {
            return;
        }
        if let Some(client) = weak.upgrade() {
            let sent = client.send(Envelope::pong(1));
            let state = (client.state(), client.is_connected(), sent);
            seen.lock().unwrap().push(state);
        }
    });
    client.on_status(&on_status);

    client.connect().await.unwrap();
    let first = accept_peer(&mut listener).await;
    first.fail("connection reset by peer");

    let _second = accept_peer(&mut listener).await;
    assert!(wait_for_state(&client, ConnectionState::Open, WAIT).await);

    let observed = observed.lock().unwrap().clone();
    verbose_println!("  Observed on disconnect: {:?}", observed);
    assert_eq!(observed, vec![(ConnectionState::Closing, false, false)]);
}

#[tokio::test]
async fn test_replay_write_failure_rejects_connect() {
    verbose_println!("Testing connect() when the subscription replay cannot be written...");

    let opens = Arc::new(AtomicUsize::new(0));
    let client = livelink::builder()
        .url("memory://gateway")
        .transport(WriteRejectingTransport {
            opens: Arc::clone(&opens),
        })
        .no_heartbeat()
        .reconnect_strategy(FixedDelay::new(Duration::from_millis(50), Some(3)))
        .subscription(SubscriptionDescriptor::alerts())
        .build()
        .unwrap();

    let result = tokio::time::timeout(WAIT, client.connect())
        .await
        .expect("connect() settles on the first attempt");
    match result {
        Err(RealtimeError::ConnectionClosed(reason)) => {
            assert!(!reason.contains("cancelled"), "unexpected reason: {reason}");
        }
        other => panic!("expected a closed-connection error, got {:?}", other),
    }
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    let gave_up = wait_for_event(&client, WAIT, |event| matches!(event, ClientEvent::GaveUp { .. })).await;
    assert_eq!(gave_up, Some(ClientEvent::GaveUp { attempts: 3 }));
    assert_eq!(opens.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_status_listener_sees_lifecycle() {
    let (transport, mut listener) = InMemoryTransport::new();
    let client = memory_client(transport);

    let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = Arc::clone(&events);
    let on_status = listener_fn(move |event: &ClientEvent| log.lock().push(event.clone()));
    assert!(client.on_status(&on_status));

    client.connect().await.unwrap();
    let _peer = accept_peer(&mut listener).await;
    client.disconnect();

    let seen = events.lock().clone();
    assert!(matches!(seen.first(), Some(ClientEvent::Connected { .. })));
    assert!(matches!(seen.last(), Some(ClientEvent::Disconnected { .. })));
    assert_eq!(client.off_status(None), 1);
}
