//! Live Store - latest-value cache fed by a realtime client
//!
//! Provides:
//! - Latest telemetry sample per tag
//! - Latest status per device
//! - Most recent alerts, newest first, bounded
//!
//! The store registers one listener per envelope kind on attach and removes
//! exactly those listeners on detach, so several stores (or other
//! consumers) can share a client.

use chrono::{DateTime, Utc};
use livelink::{listener_fn, Envelope, EnvelopeKind, ListenerRef, Received, RealtimeClient};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Default number of alerts kept
pub const DEFAULT_ALERT_CAPACITY: usize = 100;

const KINDS: [EnvelopeKind; 3] = [
    EnvelopeKind::Telemetry,
    EnvelopeKind::DeviceStatus,
    EnvelopeKind::Alert,
];

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TagSample {
    pub value: Value,
    pub quality: String,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl DeviceState {
    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertRecord {
    pub event_id: String,
    pub severity: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
struct StoreInner {
    tags: HashMap<String, TagSample>,
    devices: HashMap<String, DeviceState>,
    alerts: VecDeque<AlertRecord>,
}

/// Queryable snapshot of the stream
#[derive(Clone)]
pub struct LiveStore {
    inner: Arc<RwLock<StoreInner>>,
    alert_capacity: usize,
    listener: ListenerRef<Received>,
}

impl LiveStore {
    pub fn new() -> Self {
        Self::with_alert_capacity(DEFAULT_ALERT_CAPACITY)
    }

    pub fn with_alert_capacity(alert_capacity: usize) -> Self {
        let inner = Arc::new(RwLock::new(StoreInner::default()));
        let capacity = alert_capacity.max(1);

        let state = Arc::clone(&inner);
        let listener = listener_fn(move |received: &Received| {
            apply_to(&mut state.write(), capacity, received);
        });

        Self {
            inner,
            alert_capacity: capacity,
            listener,
        }
    }

    /// Start receiving telemetry, device status and alerts from `client`
    pub fn attach(&self, client: &RealtimeClient) {
        for kind in KINDS {
            client.on(kind, &self.listener);
        }
        debug!("Live store attached");
    }

    /// Remove this store's listeners; other listeners are untouched
    pub fn detach(&self, client: &RealtimeClient) {
        for kind in KINDS {
            client.off(kind, Some(&self.listener));
        }
        debug!("Live store detached");
    }

    /// Fold one envelope into the store
    pub fn apply(&self, received: &Received) {
        apply_to(&mut self.inner.write(), self.alert_capacity, received);
    }

    pub fn latest(&self, tag_id: &str) -> Option<TagSample> {
        self.inner.read().tags.get(tag_id).cloned()
    }

    pub fn device_status(&self, device_id: &str) -> Option<DeviceState> {
        self.inner.read().devices.get(device_id).cloned()
    }

    /// Up to `limit` alerts, newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        self.inner.read().alerts.iter().take(limit).cloned().collect()
    }

    pub fn tag_count(&self) -> usize {
        self.inner.read().tags.len()
    }

    pub fn device_count(&self) -> usize {
        self.inner.read().devices.len()
    }

    pub fn alert_count(&self) -> usize {
        self.inner.read().alerts.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.tags.clear();
        inner.devices.clear();
        inner.alerts.clear();
    }
}

impl Default for LiveStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_to(inner: &mut StoreInner, alert_capacity: usize, received: &Received) {
    match &received.envelope {
        Envelope::Telemetry {
            tag_id,
            value,
            quality,
            timestamp,
        } => {
            // Out-of-order samples never replace a newer one
            if let Some(existing) = inner.tags.get(tag_id) {
                if existing.timestamp > *timestamp {
                    return;
                }
            }
            inner.tags.insert(
                tag_id.clone(),
                TagSample {
                    value: value.clone(),
                    quality: quality.clone(),
                    timestamp: *timestamp,
                    received_at: received.received_at,
                },
            );
        }
        Envelope::DeviceStatus {
            device_id,
            status,
            timestamp,
        } => {
            if let Some(existing) = inner.devices.get(device_id) {
                if existing.timestamp > *timestamp {
                    return;
                }
            }
            inner.devices.insert(
                device_id.clone(),
                DeviceState {
                    status: status.clone(),
                    timestamp: *timestamp,
                },
            );
        }
        Envelope::Alert {
            event_id,
            severity,
            message,
            timestamp,
        } => {
            inner.alerts.push_front(AlertRecord {
                event_id: event_id.clone(),
                severity: severity.clone(),
                message: message.clone(),
                timestamp: *timestamp,
            });
            inner.alerts.truncate(alert_capacity);
        }
        _ => {}
    }
}
