//! Pub/Sub event bus for lifecycle notifications.
//!
//! The worker has two event sources: the log instance manager announces
//! membership changes after every register/deregister, and the router raises
//! a termination event when the `Shutdown` command arrives. Subscribers are
//! invoked synchronously in FIFO order within an event type.
//!
//! Emitters must never hold a data lock while calling `emit()` - subscribers
//! are allowed to re-enter the emitting component (e.g. a registry-changed
//! subscriber enumerating log keys), so dispatch always happens after the
//! triggering mutation has released its lock.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Marker trait for events. Events must be Send + Sync + 'static.
pub trait Event: Any + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

// Blanket impl for all qualifying types
impl<T: Any + Send + Sync + 'static> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type-erased callback
type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// Synchronous pub/sub bus. Cloning shares the subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<TypeId, Vec<Callback>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events of type E. The callback fires on the emitting
    /// thread; keep it short and use channels for anything blocking.
    pub fn subscribe<E, F>(&self, callback: F)
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let wrapped: Callback = Arc::new(move |any: &dyn Any| {
            if let Some(event) = any.downcast_ref::<E>() {
                callback(event);
            }
        });
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(TypeId::of::<E>())
            .or_default()
            .push(wrapped);
    }

    /// Invoke all subscribers for E, first-subscribed first.
    pub fn emit<E: Event>(&self, event: E) {
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        if let Some(cbs) = subscribers.get(&TypeId::of::<E>()) {
            for cb in cbs {
                cb(event.as_any());
            }
        }
    }

    /// Check if there are subscribers for event type E
    pub fn has_subscribers<E: Event>(&self) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }
}
