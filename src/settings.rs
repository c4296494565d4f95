//! Realtime client settings
//!
//! Settings come from a YAML file (every field optional, missing fields
//! take the production preset), then environment overrides are applied:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `GATEWAY_WS_URL` | `url` |
//! | `GATEWAY_WS_MAX_RECONNECT_ATTEMPTS` | `reconnect.max_attempts` (0 = unlimited) |
//! | `GATEWAY_WS_RECONNECT_INTERVAL_MS` | `reconnect.initial_delay_ms` |
//! | `GATEWAY_WS_HEARTBEAT_INTERVAL_MS` | `heartbeat.interval_ms` |
//! | `GATEWAY_LOG_LEVEL` | `log_level` |

use crate::bin_common::parse_topic_arg;
use livelink::{
    ExponentialBackoff, RealtimeClient, RealtimeError, StaticHeaders, SubscriptionDescriptor,
    Transport,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const ENV_URL: &str = "GATEWAY_WS_URL";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "GATEWAY_WS_MAX_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_INTERVAL_MS: &str = "GATEWAY_WS_RECONNECT_INTERVAL_MS";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "GATEWAY_WS_HEARTBEAT_INTERVAL_MS";
pub const ENV_LOG_LEVEL: &str = "GATEWAY_LOG_LEVEL";

const VALID_LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load settings file: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Failed to build client: {0}")]
    Client(#[from] RealtimeError),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Named connection profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Development,
    Production,
    Testing,
}

impl Preset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Development => "development",
            Preset::Production => "production",
            Preset::Testing => "testing",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Preset::Development),
            "production" | "prod" => Ok(Preset::Production),
            "testing" | "test" => Ok(Preset::Testing),
            _ => Err(SettingsError::InvalidValue {
                key: "preset".into(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    /// Consecutive failures before giving up (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectSettings {
    pub fn strategy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
        .with_multiplier(self.multiplier)
        .with_jitter(self.jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 10_000,
        }
    }
}

/// Everything needed to build a [`RealtimeClient`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    pub url: String,
    pub auto_reconnect: bool,
    pub reconnect: ReconnectSettings,
    pub heartbeat: HeartbeatSettings,
    pub connect_timeout_ms: u64,
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
    /// Extra headers for the WebSocket upgrade request
    pub headers: BTreeMap<String, String>,
    pub answer_server_pings: bool,
    /// Subscriptions registered at startup (`tag:T1`, `device:D1`, `alerts`, ...)
    pub subscriptions: Vec<String>,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self::preset(Preset::Production)
    }
}

impl RealtimeSettings {
    pub fn preset(preset: Preset) -> Self {
        let base = Self {
            url: "ws://localhost:8080/ws/telemetry".into(),
            auto_reconnect: true,
            reconnect: ReconnectSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            connect_timeout_ms: 10_000,
            log_level: "info".into(),
            headers: BTreeMap::new(),
            answer_server_pings: true,
            subscriptions: Vec::new(),
        };

        match preset {
            Preset::Production => base,
            Preset::Development => Self {
                url: "ws://localhost:50016/ws".into(),
                reconnect: ReconnectSettings {
                    max_attempts: Some(5),
                    ..base.reconnect
                },
                heartbeat: HeartbeatSettings {
                    enabled: true,
                    interval_ms: 10_000,
                    timeout_ms: 5_000,
                },
                log_level: "debug".into(),
                ..base
            },
            Preset::Testing => Self {
                auto_reconnect: false,
                reconnect: ReconnectSettings {
                    max_attempts: Some(3),
                    ..base.reconnect
                },
                heartbeat: HeartbeatSettings {
                    enabled: true,
                    interval_ms: 5_000,
                    timeout_ms: 2_000,
                },
                ..base
            },
        }
    }

    /// Load settings from a YAML file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml_content = std::fs::read_to_string(path)?;
        let mut settings = Self::from_yaml(&yaml_content)?;
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Like [`load`](Self::load), but a missing file falls back to `preset`
    pub fn load_or_default(path: impl AsRef<Path>, preset: Preset) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        info!("Settings file {} not found, using {} preset", path.display(), preset);
        let mut settings = Self::preset(preset);
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_URL) {
            info!("Overriding url from {}", ENV_URL);
            self.url = url;
        }
        if let Some(value) = lookup(ENV_MAX_RECONNECT_ATTEMPTS) {
            let attempts: u32 = parse_value(ENV_MAX_RECONNECT_ATTEMPTS, &value)?;
            self.reconnect.max_attempts = (attempts > 0).then_some(attempts);
        }
        if let Some(value) = lookup(ENV_RECONNECT_INTERVAL_MS) {
            self.reconnect.initial_delay_ms = parse_value(ENV_RECONNECT_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_HEARTBEAT_INTERVAL_MS) {
            self.heartbeat.interval_ms = parse_value(ENV_HEARTBEAT_INTERVAL_MS, &value)?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level.trim().to_ascii_lowercase();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(SettingsError::ValidationError("url cannot be empty".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(SettingsError::ValidationError(
                "connect_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(SettingsError::ValidationError(
                "reconnect.initial_delay_ms must be greater than 0".into(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(SettingsError::ValidationError(
                "reconnect.max_delay_ms must not be below reconnect.initial_delay_ms".into(),
            ));
        }
        if self.reconnect.multiplier.is_nan() || self.reconnect.multiplier < 1.0 {
            return Err(SettingsError::ValidationError(
                "reconnect.multiplier must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(SettingsError::ValidationError(
                "reconnect.jitter must be between 0 and 1".into(),
            ));
        }
        if self.heartbeat.enabled
            && (self.heartbeat.timeout_ms == 0 || self.heartbeat.timeout_ms >= self.heartbeat.interval_ms)
        {
            return Err(SettingsError::ValidationError(
                "heartbeat.timeout_ms must be positive and shorter than heartbeat.interval_ms".into(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(SettingsError::ValidationError(format!(
                "log_level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            )));
        }
        self.subscription_descriptors()?;
        Ok(())
    }

    pub fn subscription_descriptors(&self) -> Result<Vec<SubscriptionDescriptor>> {
        self.subscriptions
            .iter()
            .map(|arg| {
                parse_topic_arg(arg).ok_or_else(|| SettingsError::InvalidValue {
                    key: "subscriptions".into(),
                    value: arg.clone(),
                })
            })
            .collect()
    }

    /// Build a client on the default WebSocket transport
    pub fn build_client(&self) -> Result<RealtimeClient> {
        self.validate()?;
        let mut builder = self.client_builder()?;
        if !self.headers.is_empty() {
            let headers = self
                .headers
                .iter()
                .fold(StaticHeaders::new(), |headers, (name, value)| headers.with(name, value));
            builder = builder.headers(headers);
        }
        Ok(builder.build()?)
    }

    /// Build a client on a caller-supplied transport; `headers` are ignored
    pub fn build_client_with_transport(&self, transport: impl Transport) -> Result<RealtimeClient> {
        self.validate()?;
        Ok(self.client_builder()?.transport(transport).build()?)
    }

    fn client_builder(
        &self,
    ) -> Result<livelink::RealtimeClientBuilder<livelink::states::HasUrl>> {
        let mut builder = livelink::builder()
            .url(self.url.clone())
            .auto_reconnect(self.auto_reconnect)
            .reconnect_strategy(self.reconnect.strategy())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .answer_server_pings(self.answer_server_pings)
            .subscriptions(self.subscription_descriptors()?);

        builder = if self.heartbeat.enabled {
            builder.heartbeat(
                Duration::from_millis(self.heartbeat.interval_ms),
                Duration::from_millis(self.heartbeat.timeout_ms),
            )
        } else {
            builder.no_heartbeat()
        };
        Ok(builder)
    }

    /// Log settings summary
    pub fn log(&self) {
        info!("Settings loaded:");
        info!("  URL: {}", self.url);
        info!(
            "  Reconnect: {} (base {} ms, cap {} ms, x{}, jitter {}, max attempts {})",
            if self.auto_reconnect { "on" } else { "off" },
            self.reconnect.initial_delay_ms,
            self.reconnect.max_delay_ms,
            self.reconnect.multiplier,
            self.reconnect.jitter,
            self.reconnect
                .max_attempts
                .map_or_else(|| "unlimited".to_string(), |max| max.to_string())
        );
        if self.heartbeat.enabled {
            info!(
                "  Heartbeat: every {} ms, pong timeout {} ms",
                self.heartbeat.interval_ms, self.heartbeat.timeout_ms
            );
        } else {
            info!("  Heartbeat: disabled");
        }
        info!("  Log level: {}", self.log_level);
        info!("  Subscriptions: {}", self.subscriptions.len());
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| SettingsError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
