//! Wire model
//!
//! Every frame is a JSON object with a `type` discriminator:
//!
//! ```text
//! { "type": "ping", "seq": 7, "ts": "2024-05-01T10:00:00Z" }
//! { "type": "subscribe", "topic": "tag-stream", "scope": { "tag_id": "T1" } }
//! { "type": "telemetry", "tag_id": "T1", "value": 21.5, "quality": "good", "timestamp": "..." }
//! ```
//!
//! Types the client does not know are kept as [`Envelope::Unknown`] with the
//! full decoded object so catch-all listeners can still inspect them.

use crate::traits::{Frame, RealtimeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Logical subscription target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Topic {
    /// Live values of one or more tags
    TagStream,
    /// Online/offline transitions of devices
    DeviceStatus,
    /// Alert notifications
    Alerts,
    /// Any other topic understood by the backend
    Custom(String),
}

impl Topic {
    pub fn as_str(&self) -> &str {
        match self {
            Topic::TagStream => "tag-stream",
            Topic::DeviceStatus => "device-status",
            Topic::Alerts => "alerts",
            Topic::Custom(name) => name,
        }
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        match name.as_str() {
            "tag-stream" => Topic::TagStream,
            "device-status" => Topic::DeviceStatus,
            "alerts" => Topic::Alerts,
            _ => Topic::Custom(name),
        }
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::from(name.to_string())
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        match topic {
            Topic::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scoping identifiers of a subscription
///
/// Keys are kept sorted, so two scopes with the same entries compare equal
/// and serialize to the same bytes regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(BTreeMap<String, Value>);

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Scope to a single tag (`{"tag_id": ...}`)
    pub fn tag(tag_id: impl Into<String>) -> Self {
        Self::new().with("tag_id", tag_id.into())
    }

    /// Scope to a single device (`{"device_id": ...}`)
    pub fn device(device_id: impl Into<String>) -> Self {
        Self::new().with("device_id", device_id.into())
    }

    /// Scope to a list of tags (`{"tag_ids": [...]}`)
    pub fn tags<I, S>(tag_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = tag_ids.into_iter().map(Into::into).collect();
        Self::new().with("tag_ids", ids)
    }

    /// Scope to a list of devices (`{"device_ids": [...]}`)
    pub fn devices<I, S>(device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = device_ids.into_iter().map(Into::into).collect();
        Self::new().with("device_ids", ids)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Discriminant of an [`Envelope`], also the key of a listener set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnvelopeKind {
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    Telemetry,
    DeviceStatus,
    Alert,
    Write,
    WriteAck,
    Error,
    /// Catch-all channel for unrecognised `type` values
    Unknown,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 11] = [
        EnvelopeKind::Ping,
        EnvelopeKind::Pong,
        EnvelopeKind::Subscribe,
        EnvelopeKind::Unsubscribe,
        EnvelopeKind::Telemetry,
        EnvelopeKind::DeviceStatus,
        EnvelopeKind::Alert,
        EnvelopeKind::Write,
        EnvelopeKind::WriteAck,
        EnvelopeKind::Error,
        EnvelopeKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Ping => "ping",
            EnvelopeKind::Pong => "pong",
            EnvelopeKind::Subscribe => "subscribe",
            EnvelopeKind::Unsubscribe => "unsubscribe",
            EnvelopeKind::Telemetry => "telemetry",
            EnvelopeKind::DeviceStatus => "device_status",
            EnvelopeKind::Alert => "alert",
            EnvelopeKind::Write => "write",
            EnvelopeKind::WriteAck => "write_ack",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Unknown => "unknown",
        }
    }

    /// Map a wire `type` value to a known kind
    ///
    /// Returns `None` for anything that must be routed to the catch-all
    /// channel, including the literal `"unknown"`.
    pub fn from_wire(value: &str) -> Option<Self> {
        EnvelopeKind::ALL
            .iter()
            .copied()
            .filter(|kind| *kind != EnvelopeKind::Unknown)
            .find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single typed message exchanged over the stream
///
/// Envelopes are immutable values: they are created when a frame is
/// decoded or right before one is encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Ping {
        seq: u64,
        #[serde(default = "Utc::now")]
        ts: DateTime<Utc>,
    },
    Pong {
        seq: u64,
    },
    Subscribe {
        topic: Topic,
        #[serde(default)]
        scope: Scope,
    },
    Unsubscribe {
        topic: Topic,
        #[serde(default)]
        scope: Scope,
    },
    Telemetry {
        tag_id: String,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        quality: String,
        timestamp: DateTime<Utc>,
    },
    DeviceStatus {
        device_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    Alert {
        event_id: String,
        severity: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Write {
        tag_id: String,
        #[serde(default)]
        value: Value,
    },
    WriteAck {
        tag_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
    /// Envelope with a `type` this client does not model
    #[serde(skip)]
    Unknown { kind: String, payload: Value },
}

impl Envelope {
    pub fn ping(seq: u64) -> Self {
        Envelope::Ping { seq, ts: Utc::now() }
    }

    pub fn pong(seq: u64) -> Self {
        Envelope::Pong { seq }
    }

    pub fn subscribe(topic: Topic, scope: Scope) -> Self {
        Envelope::Subscribe { topic, scope }
    }

    pub fn unsubscribe(topic: Topic, scope: Scope) -> Self {
        Envelope::Unsubscribe { topic, scope }
    }

    pub fn write(tag_id: impl Into<String>, value: impl Into<Value>) -> Self {
        Envelope::Write {
            tag_id: tag_id.into(),
            value: value.into(),
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Ping { .. } => EnvelopeKind::Ping,
            Envelope::Pong { .. } => EnvelopeKind::Pong,
            Envelope::Subscribe { .. } => EnvelopeKind::Subscribe,
            Envelope::Unsubscribe { .. } => EnvelopeKind::Unsubscribe,
            Envelope::Telemetry { .. } => EnvelopeKind::Telemetry,
            Envelope::DeviceStatus { .. } => EnvelopeKind::DeviceStatus,
            Envelope::Alert { .. } => EnvelopeKind::Alert,
            Envelope::Write { .. } => EnvelopeKind::Write,
            Envelope::WriteAck { .. } => EnvelopeKind::WriteAck,
            Envelope::Error { .. } => EnvelopeKind::Error,
            Envelope::Unknown { .. } => EnvelopeKind::Unknown,
        }
    }

    /// The `type` value this envelope carries on the wire
    pub fn wire_type(&self) -> &str {
        match self {
            Envelope::Unknown { kind, .. } => kind,
            other => other.kind().as_str(),
        }
    }

    /// Encode as a JSON text frame
    pub fn to_frame(&self) -> Result<Frame> {
        self.to_json().map(Frame::Text)
    }

    pub fn to_json(&self) -> Result<String> {
        match self {
            Envelope::Unknown { kind, payload } => {
                let object = match payload {
                    Value::Object(map) => {
                        let mut object = map.clone();
                        object.insert("type".to_string(), Value::String(kind.clone()));
                        object
                    }
                    other => {
                        let mut object = Map::new();
                        object.insert("type".to_string(), Value::String(kind.clone()));
                        object.insert("data".to_string(), other.clone());
                        object
                    }
                };
                serde_json::to_string(&Value::Object(object))
                    .map_err(|e| RealtimeError::EncodeError(e.to_string()))
            }
            known => serde_json::to_string(known)
                .map_err(|e| RealtimeError::EncodeError(e.to_string())),
        }
    }

    /// Decode a frame; binary frames must carry UTF-8 JSON
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let text = frame
            .to_utf8()
            .ok_or_else(|| RealtimeError::ParseError("binary frame is not UTF-8".into()))?;
        Self::from_json(text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RealtimeError::ParseError("missing string `type` field".into()))?
            .to_string();

        if EnvelopeKind::from_wire(&kind).is_none() {
            return Ok(Envelope::Unknown {
                kind,
                payload: value,
            });
        }

        serde_json::from_value(value)
            .map_err(|e| RealtimeError::ParseError(format!("malformed `{}` envelope: {}", kind, e)))
    }
}

/// An inbound envelope together with its receipt metadata
#[derive(Debug, Clone)]
pub struct Received {
    pub envelope: Envelope,
    pub received_at: DateTime<Utc>,
    /// Connection epoch the frame arrived on
    pub epoch: u64,
}

impl Received {
    pub fn kind(&self) -> EnvelopeKind {
        self.envelope.kind()
    }
}
