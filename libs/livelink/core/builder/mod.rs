pub mod states;

use crate::core::client::RealtimeClient;
use crate::core::config::{ClientConfig, HeartbeatConfig, DEFAULT_CONNECT_TIMEOUT};
use crate::core::registry::SubscriptionDescriptor;
use crate::core::websocket::WebSocketTransport;
use crate::traits::*;
use states::*;
use std::sync::Arc;
use std::time::Duration;

/// Type-state builder for [`RealtimeClient`]
///
/// The endpoint is required before `build` becomes available; everything
/// else has a default:
///
/// | setting            | default                                   |
/// |--------------------|-------------------------------------------|
/// | transport          | WebSocket (tokio-tungstenite)             |
/// | heartbeat          | ping every 30s, pong within 10s           |
/// | reconnect strategy | exponential 1s..30s, x2, 20% jitter, 10 tries |
/// | connect timeout    | 10s                                       |
pub struct RealtimeClientBuilder<U>
where
    U: UrlState,
{
    _state: TypeState<U>,
    url: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    headers: Option<Arc<dyn HeaderProvider>>,
    heartbeat: Option<HeartbeatConfig>,
    reconnect_strategy: Option<Arc<dyn ReconnectionStrategy>>,
    auto_reconnect: bool,
    connect_timeout: Duration,
    answer_server_pings: bool,
    subscriptions: Vec<SubscriptionDescriptor>,
}

impl RealtimeClientBuilder<NoUrl> {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            _state: TypeState::new(),
            url: None,
            transport: None,
            headers: None,
            heartbeat: Some(HeartbeatConfig::default()),
            reconnect_strategy: None,
            auto_reconnect: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            answer_server_pings: true,
            subscriptions: Vec::new(),
        }
    }
}

impl Default for RealtimeClientBuilder<NoUrl> {
    fn default() -> Self {
        Self::new()
    }
}

// URL setting
impl RealtimeClientBuilder<NoUrl> {
    pub fn url(self, url: impl Into<String>) -> RealtimeClientBuilder<HasUrl> {
        RealtimeClientBuilder {
            _state: TypeState::new(),
            url: Some(url.into()),
            transport: self.transport,
            headers: self.headers,
            heartbeat: self.heartbeat,
            reconnect_strategy: self.reconnect_strategy,
            auto_reconnect: self.auto_reconnect,
            connect_timeout: self.connect_timeout,
            answer_server_pings: self.answer_server_pings,
            subscriptions: self.subscriptions,
        }
    }
}

// Optional configuration methods
impl<U> RealtimeClientBuilder<U>
where
    U: UrlState,
{
    /// Use a custom transport instead of the WebSocket default
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Upgrade headers for the default WebSocket transport
    ///
    /// Ignored when a custom transport is set.
    pub fn headers(mut self, provider: impl HeaderProvider + 'static) -> Self {
        self.headers = Some(Arc::new(provider));
        self
    }

    /// Ping every `interval`; a ping unanswered after `timeout` drops the
    /// connection
    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat = Some(HeartbeatConfig::new(interval, timeout));
        self
    }

    pub fn no_heartbeat(mut self) -> Self {
        self.heartbeat = None;
        self
    }

    pub fn reconnect_strategy(mut self, strategy: impl ReconnectionStrategy + 'static) -> Self {
        self.reconnect_strategy = Some(Arc::new(strategy));
        self
    }

    /// Disable to make the first failure or drop terminal
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn answer_server_pings(mut self, enabled: bool) -> Self {
        self.answer_server_pings = enabled;
        self
    }

    /// Register a subscription before the first connection
    pub fn subscription(mut self, descriptor: SubscriptionDescriptor) -> Self {
        self.subscriptions.push(descriptor);
        self
    }

    pub fn subscriptions(mut self, descriptors: Vec<SubscriptionDescriptor>) -> Self {
        self.subscriptions.extend(descriptors);
        self
    }
}

// Build method - only available when the URL is set
impl RealtimeClientBuilder<HasUrl> {
    /// Validate the configuration and create an idle client
    ///
    /// No connection is made until [`RealtimeClient::connect`] is called, so
    /// this does not need a runtime.
    pub fn build(self) -> Result<RealtimeClient> {
        let url = self
            .url
            .ok_or_else(|| RealtimeError::Configuration("url must be set".into()))?;

        let transport = match (self.transport, self.headers) {
            (Some(transport), _) => transport,
            (None, Some(headers)) => Arc::new(WebSocketTransport::from_provider(headers)),
            (None, None) => Arc::new(WebSocketTransport::new()),
        };

        let reconnect_strategy = self
            .reconnect_strategy
            .unwrap_or_else(|| Arc::new(ExponentialBackoff::default()));

        let config = ClientConfig {
            url,
            transport,
            heartbeat: self.heartbeat,
            reconnect_strategy,
            auto_reconnect: self.auto_reconnect,
            connect_timeout: self.connect_timeout,
            answer_server_pings: self.answer_server_pings,
        };
        config.validate()?;

        let client = RealtimeClient::new(config);
        for descriptor in self.subscriptions {
            client.subscribe(descriptor);
        }
        Ok(client)
    }
}
