//! # LiveLink Traits
//!
//! Seams of the LiveLink real-time client:
//!
//! - **Transport**: open a framed, bidirectional connection
//! - **ReconnectionStrategy**: decide whether and when to retry
//! - **HeaderProvider**: supply upgrade headers per connection attempt
//! - **Listener**: receive decoded envelopes and lifecycle events
//!
//! ## Example
//!
//! ```rust,ignore
//! use livelink::traits::*;
//!
//! struct Quiet;
//!
//! impl ReconnectionStrategy for Quiet {
//!     fn next_delay(&self, _attempt: u32) -> Duration { Duration::from_secs(60) }
//!     fn should_reconnect(&self, failures: u32) -> bool { failures < 2 }
//!     fn max_attempts(&self) -> Option<u32> { Some(2) }
//! }
//! ```

pub mod error;
pub mod frame;
pub mod headers;
pub mod listener;
pub mod reconnect;
pub mod transport;

// Re-export commonly used types
pub use error::{RealtimeError, Result};
pub use frame::Frame;
pub use headers::{HeaderProvider, Headers, NoHeaders, StaticHeaders};
pub use listener::{listener_fn, Listener, ListenerRef};
pub use reconnect::{
    ExponentialBackoff, FixedDelay, NeverReconnect, ReconnectionStrategy, MIN_RECONNECT_DELAY,
};
pub use transport::{FrameSink, FrameStream, Transport};
