//! # LiveLink
//!
//! Reconnecting real-time event client for the gateway dashboard.
//!
//! ## Features
//!
//! - **Single driver task**: transport, heartbeat and reconnect timer live in
//!   one task; the facade never blocks on the network
//! - **Type-state builder**: the endpoint is checked at compile time
//! - **Subscription replay**: the registry survives reconnects and is
//!   replayed in insertion order on every open
//! - **Epoch-tagged sends**: frames queued on a dead connection are dropped
//! - **Pluggable transport**: WebSocket by default, in-memory for tests

pub mod traits;
pub mod core;

// Re-export all traits
pub use traits::*;

// Re-export core client functionality
pub use self::core::{
    builder, client, config, connection_state, dispatcher, envelope, heartbeat, memory,
    pong_tracker, registry, websocket,
    builder::{states, RealtimeClientBuilder},
    client::{ClientEvent, Metrics, RealtimeClient},
    config::{ClientConfig, HeartbeatConfig},
    connection_state::{AtomicConnectionState, AtomicMetrics, ConnectionState},
    envelope::{Envelope, EnvelopeKind, Received, Scope, Topic},
    memory::{InMemoryTransport, PeerConnection, PeerListener},
    registry::{Subscription, SubscriptionDescriptor, SubscriptionHandle},
    websocket::WebSocketTransport,
};

// Convenience function
pub use self::core::builder as client_builder;
