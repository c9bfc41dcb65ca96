//! Observer channels for monitor notifications.
//!
//! Each channel keeps an explicit, ordered list of subscribers. Delivery is
//! synchronous on the caller's thread; the monitor only emits from its
//! dispatcher thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Token returned by [`EventChannel::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A single event channel with deterministic subscribe/unsubscribe.
pub struct EventChannel<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T> Default for EventChannel<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> std::fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.handlers.lock().len())
            .finish()
    }
}

impl<T> EventChannel<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    /// Removes a subscriber. Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Delivers `value` to every subscriber in subscription order.
    ///
    /// The subscriber list is snapshotted first, so handlers may subscribe or
    /// unsubscribe without deadlocking.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in snapshot {
            handler(value);
        }
    }
}

/// The three notification channels exposed by the monitor.
#[derive(Debug, Default)]
pub struct MonitorEvents {
    /// Fired after enumeration-affecting topology changes and after initialization
    pub device_list_changed: EventChannel<()>,
    /// Fired with the new endpoint id after a default-tracking swap
    pub default_device_changed: EventChannel<String>,
    /// Fired with the latest level on every sampler tick that produces one
    pub volume_level_changed: EventChannel<f32>,
}
