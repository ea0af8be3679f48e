//! Listener registry and event dispatch

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;

use super::listener::Listener;
use super::message::Message;

/// Identity of a registered listener (address of its shared allocation)
type ListenerKey = usize;

type ListenerSet = HashMap<ListenerKey, Arc<dyn Listener>>;

fn key_of(listener: &Arc<dyn Listener>) -> ListenerKey {
    Arc::as_ptr(listener) as *const () as usize
}

/// Event name → set of listeners.
///
/// The lock is only held for map updates and snapshots, never while a
/// listener runs, so listeners may add or remove registrations (including
/// their own) from inside `deliver`.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<String, ListenerSet>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ListenerSet>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `listener` for `event`. Adding the same listener twice is a no-op.
    pub fn add_listener(&self, event: &str, listener: Arc<dyn Listener>) {
        self.lock()
            .entry(event.to_string())
            .or_default()
            .insert(key_of(&listener), listener);
    }

    /// Deregister `listener` from `event`. Returns whether it was registered.
    pub fn remove_listener(&self, event: &str, listener: &Arc<dyn Listener>) -> bool {
        let mut map = self.lock();
        let Some(set) = map.get_mut(event) else {
            return false;
        };
        let removed = set.remove(&key_of(listener)).is_some();
        if set.is_empty() {
            map.remove(event);
        }
        removed
    }

    /// Number of listeners currently registered for `event`
    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().get(event).map_or(0, HashMap::len)
    }

    /// True when nothing is registered for any event
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn snapshot(&self, event: &str) -> Vec<Arc<dyn Listener>> {
        self.lock()
            .get(event)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver `message` to every listener registered for `event` at the time
    /// of the call.
    ///
    /// Deliveries run concurrently; a failing listener is logged and does not
    /// stop the others. Returns the number of listeners reached.
    pub async fn trigger_listener(&self, event: &str, message: &Message) -> usize {
        let listeners = self.snapshot(event);
        if listeners.is_empty() {
            tracing::trace!(event, "no listeners, message discarded");
            return 0;
        }

        let results = join_all(listeners.iter().map(|l| l.deliver(message))).await;
        let mut delivered = 0;
        for result in results {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(event, error = %e, "listener rejected message"),
            }
        }
        delivered
    }

    /// Remove every listener and cancel each one. Used on teardown.
    pub async fn cancel_all_listener(&self) {
        let drained: Vec<Arc<dyn Listener>> = self
            .lock()
            .drain()
            .flat_map(|(_, set)| set.into_values())
            .collect();

        for result in join_all(drained.iter().map(|l| l.cancel())).await {
            if let Err(e) = result {
                tracing::debug!(error = %e, "listener cancel failed");
            }
        }
    }
}
