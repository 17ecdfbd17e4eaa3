use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;

/// Identifies one handler registration on an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Synchronous multi-subscriber notification.
///
/// `broadcast` calls every handler on the calling thread, in registration
/// order, over a snapshot of the handler list taken before the first call.
/// Handlers may therefore subscribe, unsubscribe, or broadcast again from
/// inside a callback; changes take effect from the next broadcast on.
pub struct Event<T> {
    handlers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler. The returned id removes it again.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.handlers).push((id, Arc::new(handler)));
        id
    }

    /// Register a handler that is removed when the returned guard drops.
    pub fn subscribe_scoped<F>(&self, handler: F) -> Subscription<'_, T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.subscribe(handler);
        Subscription { event: self, id }
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Deliver `value` to every handler registered at the time of the call.
    pub fn broadcast(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = lock(&self.handlers)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(value);
        }
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).len()
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

/// Unsubscribes its handler on drop.
#[must_use = "the handler is removed as soon as the subscription is dropped"]
pub struct Subscription<'a, T> {
    event: &'a Event<T>,
    id: SubscriptionId,
}

impl<T> Subscription<'_, T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl<T> Drop for Subscription<'_, T> {
    fn drop(&mut self) {
        self.event.unsubscribe(self.id);
    }
}
