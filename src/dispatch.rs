//! Ordered fan-out of decoded events to registered subscriber callbacks.
//!
//! One registry per client: event kind → ordered handler list. Registration
//! is permitted before or during an active session; handlers are never
//! removed. Dispatch of one event completes before the owning loop moves to
//! the next inbound frame, so handlers observe frames in wire order.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use frames::{EventKind, LiveEvent};
use serde_json::Value;

/// Caller-supplied key/value context captured at session start and forwarded,
/// unchanged, to every handler invocation for the session's lifetime.
pub type Context = HashMap<String, Value>;

/// A subscriber callback. Runs synchronously on the dispatching loop, so it
/// must not block unboundedly; long-running work belongs behind a channel or
/// a spawned task inside the handler.
pub type Handler = Arc<dyn Fn(&LiveEvent, &Context) + Send + Sync>;

/// Registry of handlers keyed by event kind.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

impl Dispatcher {
    /// Register a handler for an event kind. Insertion order is invocation
    /// order relative to other handlers of the same kind.
    pub fn on(&self, kind: EventKind, handler: Handler) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        handlers.entry(kind).or_default().push(handler);
    }

    /// Invoke every handler registered for the event's kind, in order.
    pub fn emit(&self, event: &LiveEvent, context: &Context) {
        // Snapshot the list so handlers can register further handlers without
        // deadlocking against the registry lock.
        let snapshot = {
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            handlers.get(&event.kind()).cloned().unwrap_or_default()
        };
        for handler in snapshot {
            handler(event, context);
        }
    }
}

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod tests;
