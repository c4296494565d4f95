//! Envelope dispatch
//!
//! Decodes inbound frames and fans each envelope out to the listeners
//! registered for its [`EnvelopeKind`]. Listener failures (an `Err` return
//! or a panic) are isolated: they are logged and counted, and delivery to
//! the remaining listeners continues.

use crate::core::connection_state::AtomicMetrics;
use crate::core::envelope::{Envelope, EnvelopeKind, Received};
use crate::traits::listener::same_listener;
use crate::traits::{Frame, ListenerRef};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Ordered set of listeners, deduplicated by identity
pub struct ListenerSet<T> {
    listeners: Vec<ListenerRef<T>>,
}

impl<T: 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Returns `false` if the same listener is already registered
    pub fn insert(&mut self, listener: &ListenerRef<T>) -> bool {
        if self.contains(listener) {
            return false;
        }
        self.listeners.push(Arc::clone(listener));
        true
    }

    pub fn remove(&mut self, listener: &ListenerRef<T>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|existing| !same_listener(existing, listener));
        self.listeners.len() != before
    }

    /// Remove every listener, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.listeners.len();
        self.listeners.clear();
        count
    }

    pub fn contains(&self, listener: &ListenerRef<T>) -> bool {
        self.listeners
            .iter()
            .any(|existing| same_listener(existing, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Copy of the current listeners
    ///
    /// Delivery iterates a snapshot so listeners may (un)register while an
    /// event is being delivered.
    pub fn snapshot(&self) -> Vec<ListenerRef<T>> {
        self.listeners.clone()
    }
}

impl<T: 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke every listener with `event`; returns the number of failures
pub fn notify_all<T: 'static>(listeners: &[ListenerRef<T>], event: &T, channel: &str) -> usize {
    let mut failures = 0;

    for (index, listener) in listeners.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| listener.call(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failures += 1;
                warn!(channel, listener = index, error = %e, "Listener returned an error");
            }
            Err(payload) => {
                failures += 1;
                warn!(
                    channel,
                    listener = index,
                    panic = %panic_message(payload.as_ref()),
                    "Listener panicked"
                );
            }
        }
    }

    failures
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Per-kind listener registry plus frame decoding
pub struct Dispatcher {
    sets: RwLock<HashMap<EnvelopeKind, ListenerSet<Received>>>,
    metrics: Arc<AtomicMetrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<AtomicMetrics>) -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Register `listener` for `kind`; registering it twice is a no-op
    pub fn on(&self, kind: EnvelopeKind, listener: &ListenerRef<Received>) -> bool {
        self.sets.write().entry(kind).or_default().insert(listener)
    }

    /// Remove one listener, or every listener of `kind` when `None`
    ///
    /// Returns how many listeners were removed.
    pub fn off(&self, kind: EnvelopeKind, listener: Option<&ListenerRef<Received>>) -> usize {
        let mut sets = self.sets.write();
        let Some(set) = sets.get_mut(&kind) else {
            return 0;
        };

        let removed = match listener {
            Some(listener) => usize::from(set.remove(listener)),
            None => set.clear(),
        };
        if set.is_empty() {
            sets.remove(&kind);
        }
        removed
    }

    pub fn listener_count(&self, kind: EnvelopeKind) -> usize {
        self.sets.read().get(&kind).map_or(0, ListenerSet::len)
    }

    /// Decode a frame, counting and logging malformed input
    pub fn decode(&self, frame: &Frame) -> Option<Envelope> {
        match Envelope::from_frame(frame) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                self.metrics.increment_parse_errors();
                warn!(bytes = frame.len(), error = %e, "Dropping malformed frame");
                None
            }
        }
    }

    /// Deliver to every listener of the envelope's kind
    ///
    /// Returns the number of listener failures.
    pub fn dispatch(&self, received: &Received) -> usize {
        let kind = received.kind();
        if let Envelope::Unknown { kind: wire_type, .. } = &received.envelope {
            debug!(wire_type = %wire_type, "Routing unrecognised envelope type to catch-all listeners");
        }

        let listeners = match self.sets.read().get(&kind) {
            Some(set) => set.snapshot(),
            None => {
                trace!(kind = %kind, "No listeners registered");
                return 0;
            }
        };

        let failures = notify_all(&listeners, received, kind.as_str());
        if failures > 0 {
            self.metrics.add_listener_failures(failures as u64);
        }
        failures
    }
}
