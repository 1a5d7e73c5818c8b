//! # Event Registry
//!
//! Explicit publish/subscribe used for status changes, dead letters and
//! session-ended notifications.
//!
//! ```text
//! bus.subscribe(a) ──► Subscription(1)
//! bus.subscribe(b) ──► Subscription(2)
//! bus.emit(&event) ──► a(&event), then b(&event)      (subscription order)
//! drop(Subscription(1)) ──► a no longer called
//! ```
//!
//! Listeners run synchronously on the emitting task, outside the registry
//! lock, so a listener may subscribe or unsubscribe without deadlocking.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

/// A listener registry for one event type.
pub struct EventBus<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        EventBus {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        EventBus {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

fn lock<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: 'static> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Delivery stops when the handle is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Delivers `event` to every current listener in subscription order.
    pub fn emit(&self, event: &T) {
        let listeners: Vec<Listener<T>> = lock(&self.registry)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stops delivery now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keeps the listener registered for the life of the bus.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&u32) + Send + Sync>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let make = move |name: &str| {
            let log = Arc::clone(&log2);
            let name = name.to_string();
            Box::new(move |v: &u32| log.lock().unwrap().push(format!("{}:{}", name, v)))
                as Box<dyn Fn(&u32) + Send + Sync>
        };
        (log, make)
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::<u32>::new();
        let (log, make) = recorder();

        let a = make("a");
        let b = make("b");
        let _sa = bus.subscribe(move |v| a(v));
        let _sb = bus.subscribe(move |v| b(v));

        bus.emit(&1);
        bus.emit(&2);

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1", "a:2", "b:2"]);
    }

    #[test]
    fn test_drop_and_unsubscribe_stop_delivery() {
        let bus = EventBus::<u32>::new();
        let (log, make) = recorder();

        let a = make("a");
        let b = make("b");
        let sa = bus.subscribe(move |v| a(v));
        let sb = bus.subscribe(move |v| b(v));
        assert_eq!(bus.listener_count(), 2);

        drop(sa);
        bus.emit(&1);
        sb.unsubscribe();
        bus.emit(&2);

        assert_eq!(*log.lock().unwrap(), vec!["b:1"]);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_detach_keeps_listener() {
        let bus = EventBus::<u32>::new();
        let (log, make) = recorder();

        let a = make("a");
        bus.subscribe(move |v| a(v)).detach();
        bus.emit(&3);

        assert_eq!(*log.lock().unwrap(), vec!["a:3"]);
    }

    #[test]
    fn test_subscription_outliving_bus_is_harmless() {
        let bus = EventBus::<u32>::new();
        let sub = bus.subscribe(|_| {});
        drop(bus);
        drop(sub);
    }

    #[test]
    fn test_listener_can_subscribe_during_emit() {
        let bus = EventBus::<u32>::new();
        let inner_bus = bus.clone();
        let nested = Arc::new(StdMutex::new(Vec::new()));
        let nested2 = Arc::clone(&nested);

        let _s = bus.subscribe(move |_| {
            nested2.lock().unwrap().push(inner_bus.subscribe(|_| {}));
        });

        bus.emit(&1);
        assert_eq!(bus.listener_count(), 2);
    }
}
