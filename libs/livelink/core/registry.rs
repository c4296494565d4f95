//! Subscription registry
//!
//! The registry is the client-side source of truth for what the backend
//! should be streaming. It survives reconnects: every time a connection
//! opens, [`SubscriptionRegistry::replay_all`] produces one subscribe frame
//! per entry, in insertion order.

use crate::core::envelope::{Envelope, Scope, Topic};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Opaque token returned by `subscribe`, required to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(String);

impl SubscriptionHandle {
    fn next() -> Self {
        Self(format!("sub-{}", NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to stream: a topic plus scoping identifiers
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionDescriptor {
    pub topic: Topic,
    pub scope: Scope,
}

impl SubscriptionDescriptor {
    pub fn new(topic: impl Into<Topic>, scope: Scope) -> Self {
        Self {
            topic: topic.into(),
            scope,
        }
    }

    pub fn tag_stream(tag_id: impl Into<String>) -> Self {
        Self::new(Topic::TagStream, Scope::tag(tag_id))
    }

    pub fn tag_streams<I, S>(tag_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Topic::TagStream, Scope::tags(tag_ids))
    }

    pub fn device_status(device_id: impl Into<String>) -> Self {
        Self::new(Topic::DeviceStatus, Scope::device(device_id))
    }

    pub fn all_device_status() -> Self {
        Self::new(Topic::DeviceStatus, Scope::new())
    }

    pub fn alerts() -> Self {
        Self::new(Topic::Alerts, Scope::new())
    }

    pub fn subscribe_envelope(&self) -> Envelope {
        Envelope::subscribe(self.topic.clone(), self.scope.clone())
    }

    pub fn unsubscribe_envelope(&self) -> Envelope {
        Envelope::unsubscribe(self.topic.clone(), self.scope.clone())
    }
}

impl fmt::Display for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic)?;
        if !self.scope.is_empty() {
            let scope = serde_json::to_string(&self.scope).map_err(|_| fmt::Error)?;
            write!(f, " {}", scope)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub descriptor: SubscriptionDescriptor,
    pub created_at: DateTime<Utc>,
}

/// Insertion-ordered set of active subscriptions
///
/// At most one entry exists per distinct descriptor.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `descriptor` unless an equal one is present
    ///
    /// Returns the handle of the (new or existing) entry and whether an
    /// insertion happened.
    pub fn add(&mut self, descriptor: SubscriptionDescriptor) -> (SubscriptionHandle, bool) {
        if let Some(existing) = self.find(&descriptor) {
            return (existing.handle.clone(), false);
        }

        let handle = SubscriptionHandle::next();
        self.entries.push(Subscription {
            handle: handle.clone(),
            descriptor,
            created_at: Utc::now(),
        });
        (handle, true)
    }

    pub fn remove(&mut self, handle: &SubscriptionHandle) -> Option<Subscription> {
        let index = self.entries.iter().position(|entry| &entry.handle == handle)?;
        Some(self.entries.remove(index))
    }

    pub fn find(&self, descriptor: &SubscriptionDescriptor) -> Option<&Subscription> {
        self.entries.iter().find(|entry| &entry.descriptor == descriptor)
    }

    /// Subscribe frames for every entry, in insertion order
    ///
    /// Does not change the registry.
    pub fn replay_all(&self) -> Vec<Envelope> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor.subscribe_envelope())
            .collect()
    }

    pub fn entries(&self) -> &[Subscription] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
