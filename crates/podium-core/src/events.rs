//! Event infrastructure for session observers.
//!
//! Provides `SessionEvent` for UI collaborators and `EventBus` for
//! subscriptions. A subscriber that panics is isolated: the panic is caught,
//! logged, and the remaining subscribers still run. Nothing in this layer
//! may take the process down.

use crate::log::LogEntry;
use crate::state::SessionState;
use crate::status::ConnectionStatus;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::error;

/// Events emitted to UI collaborators.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// The document changed; carries the full replacement snapshot.
    StateChanged { state: SessionState },
    /// The connection status field changed.
    StatusChanged { status: ConnectionStatus },
    /// A new operator-facing log entry was appended.
    Log { entry: LogEntry },
    /// The host asked followers to discard any unsent draft. Duplicates are
    /// expected; handlers must be idempotent.
    ResetForm,
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus publishing session events to subscribers.
///
/// Thread-safe; wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(SessionEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns a `Subscription` that unsubscribes on
    /// drop. Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write avoids deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    ///
    /// The callback list is cloned first so a callback may subscribe or
    /// unsubscribe without deadlocking. A panicking callback is caught and
    /// logged; later callbacks still run.
    pub fn emit(&self, event: SessionEvent) {
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            let event = event.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Subscriber panicked while handling a session event");
            }
        }
    }
}
