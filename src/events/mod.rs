//! Synchronous per-component event bus.
//!
//! Each kernel component owns one `EventBus<E>` over its own event enum.
//! Handlers subscribe to a single event kind (the wire name returned by
//! [`BusEvent::kind`]) or to every kind, and are invoked synchronously in
//! registration order on `emit`. There is no buffering: an event emitted with
//! no subscribers is counted and dropped.
//!
//! Handlers receive `&E` and cannot call back into the emitting component
//! (the component is mutably borrowed while it emits). Observers that need to
//! react should record what they saw and act after the call returns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Wildcard kind accepted by [`EventBus::subscribe`].
pub const ALL_EVENTS: &str = "*";

/// Implemented by every component event enum.
pub trait BusEvent: fmt::Debug {
    /// Wire name of the event, e.g. `task:scheduled`.
    fn kind(&self) -> &'static str;
}

/// Receipt returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Handler<E> = Box<dyn FnMut(&E) + Send>;

struct Registration<E> {
    id: SubscriptionId,
    kind: String,
    handler: Handler<E>,
}

impl<E> Registration<E> {
    fn matches(&self, kind: &str) -> bool {
        self.kind == ALL_EVENTS || self.kind == kind
    }
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_emitted: u64,
    pub deliveries: u64,
    pub active_subscriptions: usize,
    /// Emitted count per event kind.
    pub by_kind: HashMap<String, u64>,
}

/// Publish/subscribe channel for one component's events.
pub struct EventBus<E> {
    registrations: Vec<Registration<E>>,
    next_id: u64,
    stats: BusStats,
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            next_id: 1,
            stats: BusStats::default(),
        }
    }

    /// Subscribe `handler` to events whose kind equals `kind` (or `"*"` for all).
    pub fn subscribe<F>(&mut self, kind: &str, handler: F) -> SubscriptionId
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.registrations.push(Registration {
            id,
            kind: kind.to_string(),
            handler: Box::new(handler),
        });
        self.stats.active_subscriptions = self.registrations.len();

        tracing::debug!("event_subscribed: id={}, kind={}", id, kind);
        id
    }

    /// Subscribe `handler` to every event kind.
    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.subscribe(ALL_EVENTS, handler)
    }

    /// Remove a subscription. Returns false if the id was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        self.stats.active_subscriptions = self.registrations.len();
        before != self.registrations.len()
    }

    /// Deliver `event` to every matching handler, in registration order.
    ///
    /// Returns the number of handlers invoked.
    pub fn emit(&mut self, event: E) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        for registration in self.registrations.iter_mut().filter(|r| r.matches(kind)) {
            (registration.handler)(&event);
            delivered += 1;
        }

        self.stats.events_emitted += 1;
        self.stats.deliveries += delivered as u64;
        *self.stats.by_kind.entry(kind.to_string()).or_default() += 1;

        tracing::trace!("event_emitted: kind={}, delivered={}", kind, delivered);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.registrations.iter().map(|r| r.kind.as_str()).collect();
        f.debug_struct("EventBus")
            .field("subscriptions", &kinds)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Test helper: a handler that appends every event it sees to a shared vec.
#[cfg(test)]
pub(crate) fn recorder<E: Clone + Send + 'static>() -> (
    std::sync::Arc<std::sync::Mutex<Vec<E>>>,
    impl FnMut(&E) + Send + 'static,
) {
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |event: &E| sink.lock().unwrap().push(event.clone()))
}
