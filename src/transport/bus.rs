//! Typed event bus.
//!
//! Handlers are keyed by [`EventKind`] and run in registration order. A handler that
//! panics is logged and skipped; the remaining handlers for the same event still run.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::frame::{EventKind, InboundEvent};

/// Callback invoked for every published event of a subscribed kind.
pub type EventHandler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of handlers per event kind.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
}

impl EventBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered for `kind`.
    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        list.len() != before
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler of its kind. Returns how many completed normally.
    pub fn publish(&self, event: &InboundEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers can (un)subscribe without deadlocking.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    let reason = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(kind = %kind, panic = %reason, "Event handler panicked");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn generic() -> InboundEvent {
        InboundEvent::Generic {
            kind: "data".to_string(),
            payload: json!({}),
        }
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let seen = Arc::clone(&seen);
            bus.on(EventKind::Generic, move |_| seen.lock().push(tag));
        }
        assert_eq!(bus.publish(&generic()), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        bus.on(EventKind::Generic, |_| panic!("boom"));
        let c = Arc::clone(&count);
        bus.on(EventKind::Generic, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&generic()), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let bus = EventBus::new();
        let first = bus.on(EventKind::Generic, |_| {});
        bus.on(EventKind::Generic, |_| {});

        assert!(bus.off(EventKind::Generic, first));
        assert!(!bus.off(EventKind::Generic, first));
        assert!(!bus.off(EventKind::LcuData, first));
        assert_eq!(bus.handler_count(EventKind::Generic), 1);
    }

    #[test]
    fn events_only_reach_their_kind() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        bus.on(EventKind::LcuData, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&generic());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let (b, s) = (Arc::clone(&bus), Arc::clone(&slot));
        let id = bus.on(EventKind::Generic, move |_| {
            if let Some(id) = *s.lock() {
                b.off(EventKind::Generic, id);
            }
        });
        *slot.lock() = Some(id);

        bus.publish(&generic());
        assert_eq!(bus.handler_count(EventKind::Generic), 0);
    }
}
