//! Event listener registry.
//!
//! Listeners subscribe to a named event or to `"*"` for everything. Dispatch
//! invokes named listeners first, then wildcard listeners, each in
//! registration order. Callbacks run outside the registry lock so a listener
//! may subscribe or unsubscribe from inside its own callback.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Subscription key matching every event.
pub const WILDCARD_EVENT: &str = "*";

type EventCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Default)]
struct ListenerMap {
    next_id: u64,
    by_event: HashMap<String, Vec<(u64, EventCallback)>>,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    inner: Mutex<ListenerMap>,
}

impl ListenerRegistry {
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        event: &str,
        callback: EventCallback,
    ) -> EventSubscription {
        let mut map = self.inner.lock();
        map.next_id += 1;
        let id = map.next_id;
        map.by_event
            .entry(event.to_string())
            .or_default()
            .push((id, callback));
        EventSubscription {
            registry: Arc::downgrade(self),
            event: event.to_string(),
            id,
        }
    }

    fn remove(&self, event: &str, id: u64) {
        let mut map = self.inner.lock();
        if let Some(listeners) = map.by_event.get_mut(event) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
            if listeners.is_empty() {
                map.by_event.remove(event);
            }
        }
    }

    pub(crate) fn dispatch(&self, event: &str, payload: &Value) {
        let callbacks: Vec<EventCallback> = {
            let map = self.inner.lock();
            let named = map.by_event.get(event).into_iter().flatten();
            let wildcard = if event == WILDCARD_EVENT {
                None
            } else {
                map.by_event.get(WILDCARD_EVENT)
            };
            named
                .chain(wildcard.into_iter().flatten())
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };
        for callback in callbacks {
            callback(event, payload);
        }
    }
}

/// Guard for a registered listener; dropping it unsubscribes.
pub struct EventSubscription {
    registry: Weak<ListenerRegistry>,
    event: String,
    id: u64,
}

impl EventSubscription {
    /// Remove the listener now instead of at scope end.
    pub fn unsubscribe(self) {}
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.event, self.id);
        }
    }
}
