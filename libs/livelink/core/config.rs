use crate::core::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PONG_TIMEOUT};
use crate::traits::*;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single connection attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat timing for an open connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings
    pub interval: Duration,
    /// Time a ping may stay unanswered; must be shorter than `interval`
    pub timeout: Duration,
}

impl HeartbeatConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(RealtimeError::Configuration(
                "heartbeat interval must be positive".into(),
            ));
        }
        if self.timeout.is_zero() || self.timeout >= self.interval {
            return Err(RealtimeError::Configuration(format!(
                "heartbeat timeout ({:?}) must be positive and shorter than the interval ({:?})",
                self.timeout, self.interval
            )));
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PONG_TIMEOUT)
    }
}

/// Resolved configuration of a [`RealtimeClient`](crate::core::client::RealtimeClient)
///
/// Built with the type-state builder; immutable once the client exists.
pub struct ClientConfig {
    /// Endpoint handed to the transport on every attempt
    pub(crate) url: String,

    pub(crate) transport: Arc<dyn Transport>,

    /// `None` disables heartbeats entirely
    pub(crate) heartbeat: Option<HeartbeatConfig>,

    pub(crate) reconnect_strategy: Arc<dyn ReconnectionStrategy>,

    /// When false the first drop or failure is terminal
    pub(crate) auto_reconnect: bool,

    pub(crate) connect_timeout: Duration,

    /// Reply to backend-initiated `ping` envelopes with a matching `pong`
    pub(crate) answer_server_pings: bool,
}

impl ClientConfig {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn has_heartbeat(&self) -> bool {
        self.heartbeat.is_some()
    }

    pub fn heartbeat(&self) -> Option<HeartbeatConfig> {
        self.heartbeat
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn answers_server_pings(&self) -> bool {
        self.answer_server_pings
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.reconnect_strategy.max_attempts()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(RealtimeError::Configuration("url must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(RealtimeError::Configuration(
                "connect timeout must be positive".into(),
            ));
        }
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.validate()?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("transport", &self.transport.name())
            .field("heartbeat", &self.heartbeat)
            .field("max_attempts", &self.max_attempts())
            .field("auto_reconnect", &self.auto_reconnect)
            .field("connect_timeout", &self.connect_timeout)
            .field("answer_server_pings", &self.answer_server_pings)
            .finish()
    }
}
