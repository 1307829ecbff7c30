//! Application listener interfaces and copy-on-write listener sets
//!
//! Notification iterates over a snapshot, so listeners may (un)register from
//! inside a callback. A panicking listener is logged and skipped; the remaining
//! listeners are still notified.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

use crate::protocol::ReceivedMessage;
use crate::transport::DeliveryId;

/// Connection state notifications
pub trait ConnectionListener: Send + Sync {
    fn on_connection_established(&self) {}

    fn on_disconnected(&self) {}

    fn on_connection_lost(&self) {}
}

/// Hand-off and broker confirmation for every publish, tracked or not
pub trait DeliveryListener: Send + Sync {
    fn on_message_published(&self, _id: DeliveryId, _topic: &str) {}

    fn on_message_confirmed(&self, id: DeliveryId, topic: &str);
}

/// Inbound messages matching a registered subscription
pub trait SubscriberListener: Send + Sync {
    fn on_message_arrived(&self, message: &ReceivedMessage);
}

/// Listener identity, independent of the trait-object vtable
pub(crate) fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Run one listener callback, containing any panic
pub(crate) fn notify_isolated<F: FnOnce()>(kind: &'static str, callback: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(callback)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(listener = kind, panic = %message, "Listener panicked, continuing with the rest");
    }
}

pub struct ListenerSet<L: ?Sized> {
    kind: &'static str,
    listeners: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Add a listener; registering the same instance twice is a no-op
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        if guard.iter().any(|existing| same_listener(existing, &listener)) {
            return false;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|existing| same_listener(existing, listener)) {
            return false;
        }
        let next: Vec<Arc<L>> = guard
            .iter()
            .filter(|existing| !same_listener(*existing, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.listeners.read().clone()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for every listener in registration order
    pub fn notify<F: Fn(&L)>(&self, f: F) {
        for listener in self.snapshot().iter() {
            notify_isolated(self.kind, || f(&**listener));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl ConnectionListener for Counting {
        fn on_connection_established(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl ConnectionListener for Panicking {
        fn on_connection_established(&self) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_add_is_idempotent_per_instance() {
        let set: ListenerSet<dyn ConnectionListener> = ListenerSet::new("connection");
        let listener: Arc<dyn ConnectionListener> = Arc::new(Counting(AtomicUsize::new(0)));

        assert!(set.add(listener.clone()));
        assert!(!set.add(listener.clone()));
        assert_eq!(set.len(), 1);

        assert!(set.remove(&listener));
        assert!(!set.remove(&listener));
        assert!(set.is_empty());
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let set: ListenerSet<dyn ConnectionListener> = ListenerSet::new("connection");
        let counter = Arc::new(Counting(AtomicUsize::new(0)));

        set.add(Arc::new(Panicking));
        set.add(counter.clone());

        set.notify(|l| l.on_connection_established());

        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_is_stable_while_modified() {
        let set: ListenerSet<dyn ConnectionListener> = ListenerSet::new("connection");
        let first: Arc<dyn ConnectionListener> = Arc::new(Counting(AtomicUsize::new(0)));
        set.add(first.clone());

        let snapshot = set.snapshot();
        set.remove(&first);

        assert_eq!(snapshot.len(), 1);
        assert!(set.is_empty());
    }
}
