//! Observer registry for session lifecycle events
//!
//! Handlers run synchronously on the emitting task, in registration order. A
//! handler that panics is logged and skipped; the remaining handlers still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

use super::device::SessionState;

/// Event categories handlers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    /// A session was created
    SessionAdded,
    /// A session was removed
    SessionRemoved,
    /// A session changed state
    SessionStateChanged,
}

/// Lifecycle notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was created for `resource`.
    SessionAdded {
        /// Canonical resource string
        resource: String,
    },
    /// The session for `resource` was removed.
    SessionRemoved {
        /// Canonical resource string
        resource: String,
    },
    /// The session for `resource` moved between states.
    SessionStateChanged {
        /// Canonical resource string
        resource: String,
        /// State before the change
        from: SessionState,
        /// State after the change
        to: SessionState,
    },
}

impl SessionEvent {
    /// Category used for subscription matching.
    pub fn kind(&self) -> SessionEventKind {
        match self {
            SessionEvent::SessionAdded { .. } => SessionEventKind::SessionAdded,
            SessionEvent::SessionRemoved { .. } => SessionEventKind::SessionRemoved,
            SessionEvent::SessionStateChanged { .. } => SessionEventKind::SessionStateChanged,
        }
    }

    /// Resource the event is about.
    pub fn resource(&self) -> &str {
        match self {
            SessionEvent::SessionAdded { resource }
            | SessionEvent::SessionRemoved { resource }
            | SessionEvent::SessionStateChanged { resource, .. } => resource,
        }
    }
}

/// Callback invoked for matching events.
pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Handle returned by [`EventRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: SessionEventKind,
    handler: EventHandler,
}

/// Subscribers keyed by event kind.
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventRegistry {
    /// Registry without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(&self, kind: SessionEventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, kind, handler });
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver `event` to every handler subscribed to its kind.
    pub fn emit(&self, event: &SessionEvent) {
        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == event.kind())
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(resource = %event.resource(), kind = ?event.kind(), "Session event handler panicked");
            }
        }
    }
}
