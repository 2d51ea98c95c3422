//! Event Bus
//!
//! Ordered publish/subscribe used by every orchestration service. Listeners
//! are invoked synchronously in registration order; a panicking listener is
//! isolated so the remaining listeners still receive the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// In-process event bus with an ordered listener list.
///
/// Cloning the bus shares the listener registry, so services constructed from
/// the same bus publish to the same observers.
pub struct EventBus<E> {
    listeners: Arc<RwLock<Vec<(SubscriptionId, Listener<E>)>>>,
    next_id: Arc<AtomicU64>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a listener. Delivery order matches registration order.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().expect("event bus poisoned");
        listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().expect("event bus poisoned");
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("event bus poisoned").len()
    }

    /// Deliver an event to every listener in registration order.
    ///
    /// A listener that panics is skipped; the panic does not propagate and
    /// does not prevent delivery to the listeners after it.
    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = {
            let listeners = self.listeners.read().expect("event bus poisoned");
            listeners.iter().map(|(_, l)| l.clone()).collect()
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!("event listener panicked; continuing delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn delivers_in_registration_order() {
        let bus: EventBus<&'static str> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = seen.clone();
            bus.subscribe(move |event: &&'static str| {
                seen.lock().unwrap().push(format!("{tag}:{event}"));
            });
        }

        bus.emit(&"x");
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &["a:x".to_string(), "b:x".to_string(), "c:x".to_string()]
        );
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(|_: &u32| panic!("listener exploded"));
        {
            let seen = seen.clone();
            bus.subscribe(move |event: &u32| seen.lock().unwrap().push(*event));
        }

        bus.emit(&7);
        assert_eq!(seen.lock().unwrap().as_slice(), &[7]);
    }

    #[test]
    fn unsubscribe_removes_listener() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let id = {
            let seen = seen.clone();
            bus.subscribe(move |event: &u32| seen.lock().unwrap().push(*event))
        };

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.emit(&1);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }
}
