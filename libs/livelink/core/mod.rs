//! # LiveLink core
//!
//! Connection driver, heartbeat, subscription registry and envelope
//! dispatch for the real-time client.
//!
//! ## Example
//!
//! ```rust,ignore
//! use livelink::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = livelink::builder()
//!         .url("ws://gateway:8080/ws/telemetry")
//!         .heartbeat(Duration::from_secs(30), Duration::from_secs(10))
//!         .reconnect_strategy(
//!             ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), Some(10))
//!                 .with_jitter(0.2),
//!         )
//!         .build()?;
//!
//!     let on_alert = listener_fn(|received: &Received| println!("{:?}", received.envelope));
//!     client.on(EnvelopeKind::Alert, &on_alert);
//!     client.subscribe(SubscriptionDescriptor::alerts());
//!     client.connect().await?;
//!
//!     while let Ok(event) = client.recv_event() {
//!         println!("Event: {:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod client;
pub mod config;
pub mod connection_state;
pub mod dispatcher;
pub mod envelope;
pub mod heartbeat;
pub mod memory;
pub mod pong_tracker;
pub mod registry;
pub mod websocket;

// Re-export main types
pub use builder::{states, RealtimeClientBuilder};
pub use client::{ClientEvent, Metrics, RealtimeClient};
pub use config::{ClientConfig, HeartbeatConfig, DEFAULT_CONNECT_TIMEOUT};
pub use connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState};
pub use dispatcher::{notify_all, Dispatcher, ListenerSet};
pub use envelope::{Envelope, EnvelopeKind, Received, Scope, Topic};
pub use heartbeat::{spawn_heartbeat, HeartbeatTask, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PONG_TIMEOUT};
pub use memory::{InMemoryTransport, PeerConnection, PeerListener};
pub use pong_tracker::{PingTracker, PongOutcome};
pub use registry::{Subscription, SubscriptionDescriptor, SubscriptionHandle, SubscriptionRegistry};
pub use websocket::WebSocketTransport;

// Re-export traits for convenience
pub use crate::traits::*;

/// Create a new client builder
///
/// # Example
/// ```ignore
/// let client = livelink::builder()
///     .url("ws://gateway:8080/ws/telemetry")
///     .subscription(SubscriptionDescriptor::tag_stream("T1"))
///     .build()?;
/// ```
pub fn builder() -> RealtimeClientBuilder<states::NoUrl> {
    RealtimeClientBuilder::new()
}
